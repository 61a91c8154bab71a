use crate::error::Result;
use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ACCENT: &str = "#0ea5e9";
pub const DEFAULT_HERO_ACCENT: &str = "#3b82f6";
pub const DEFAULT_SUBTITLE: &str =
    "Demo-only UI • Few-shot • Generation • Classification + heatmap";
pub const DEFAULT_HEATMAP_ALPHA: f32 = 0.45;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Branding {
    pub name: String,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub hero_logo: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub hero_accent: Option<String>,
    #[serde(default)]
    pub plus_icon: Option<String>,
    #[serde(default)]
    pub accent_colors: IndexMap<String, String>,
    #[serde(default)]
    pub app_icons: IndexMap<String, String>,
}

/// A config value that may be written as a single object or a list of them.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Self::Many(items) => items.iter(),
            Self::One(item) => std::slice::from_ref(item).iter(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GeneratedItem {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClassificationItem {
    #[serde(default)]
    pub test_image: Option<String>,
    #[serde(default)]
    pub heatmap: Option<String>,
    #[serde(default = "default_heatmap_alpha")]
    pub heatmap_alpha: f32,
    #[serde(default = "default_predicted_class")]
    pub predicted_class: String,
    #[serde(default)]
    pub why: Option<String>,
    #[serde(default)]
    pub observation: Option<String>,
}

const fn default_heatmap_alpha() -> f32 {
    DEFAULT_HEATMAP_ALPHA
}

fn default_predicted_class() -> String {
    "—".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct DomainConfig {
    pub title: String,
    #[serde(default)]
    pub fewshot: Vec<String>,
    #[serde(default)]
    pub fewshot_captions: Vec<String>,
    #[serde(default)]
    pub generated: OneOrMany<GeneratedItem>,
    #[serde(default)]
    pub classification: OneOrMany<ClassificationItem>,
}

impl DomainConfig {
    /// Caption for few-shot example `index`. Captions are only used when
    /// there is exactly one per example.
    #[must_use]
    pub fn fewshot_caption(&self, index: usize) -> String {
        if self.fewshot_captions.len() == self.fewshot.len() {
            if let Some(caption) = self.fewshot_captions.get(index) {
                return caption.clone();
            }
        }
        format!("Example {}", index + 1)
    }

    /// Generated samples that have at least an image or a caption.
    #[must_use]
    pub fn generated_items(&self) -> Vec<&GeneratedItem> {
        self.generated
            .iter()
            .filter(|g| g.image.is_some() || g.caption.is_some())
            .collect()
    }

    #[must_use]
    pub fn classification_items(&self) -> Vec<&ClassificationItem> {
        self.classification.iter().collect()
    }
}

#[derive(Deserialize, Debug)]
struct RawConfig {
    branding: Branding,
    domains: IndexMap<String, DomainConfig>,
}

/// Static demo content. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub branding: Branding,
    /// Domains in file order.
    pub domains: IndexMap<String, DomainConfig>,
    base_dir: PathBuf,
    assets: IndexSet<String>,
}

/// True for sources the browser can load directly.
#[must_use]
pub fn is_url(source: &str) -> bool {
    let lower = source.trim().to_ascii_lowercase();
    ["http://", "https://", "data:"]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

impl DemoConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_json(&content, base_dir)
    }

    pub fn from_json(content: &str, base_dir: PathBuf) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(content)?;
        let mut config = Self {
            branding: raw.branding,
            domains: raw.domains,
            base_dir,
            assets: IndexSet::new(),
        };
        config.assets = config.collect_assets();
        Ok(config)
    }

    fn collect_assets(&self) -> IndexSet<String> {
        let b = &self.branding;
        let branding = [&b.logo, &b.hero_logo, &b.plus_icon]
            .into_iter()
            .flatten()
            .chain(b.app_icons.values());

        let domains = self.domains.values().flat_map(|d| {
            let generated = d.generated.iter().filter_map(|g| g.image.as_ref());
            let classified = d
                .classification
                .iter()
                .flat_map(|c| [&c.test_image, &c.heatmap])
                .flatten();
            d.fewshot.iter().chain(generated).chain(classified)
        });

        branding
            .chain(domains)
            .filter(|source| !is_url(source))
            .cloned()
            .collect()
    }

    /// Resolve a configured path against the config file's directory.
    #[must_use]
    pub fn resolve(&self, source: &str) -> PathBuf {
        let path = Path::new(source);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Path of the registered asset with this id, if it exists on disk.
    #[must_use]
    pub fn asset_path(&self, id: usize) -> Option<PathBuf> {
        self.assets
            .get_index(id)
            .map(|source| self.resolve(source))
            .filter(|path| path.is_file())
    }

    /// On-disk path of a configured local source, if it exists.
    #[must_use]
    pub fn local_path(&self, source: &str) -> Option<PathBuf> {
        let id = self.assets.get_index_of(source.trim())?;
        self.asset_path(id)
    }

    /// Browser-facing source for a configured image, or `None` when the file
    /// is missing and nothing should be rendered.
    #[must_use]
    pub fn image_src(&self, source: Option<&str>) -> Option<String> {
        let source = source?.trim();
        if source.is_empty() {
            return None;
        }
        if is_url(source) {
            return Some(source.to_string());
        }
        let id = self.assets.get_index_of(source)?;
        self.asset_path(id).map(|_| format!("/assets/{id}"))
    }

    /// Whether a classification item can be shown as a heatmap overlay.
    /// Both the test image and its heatmap must exist on disk.
    #[must_use]
    pub fn has_overlay(&self, item: &ClassificationItem) -> bool {
        match (&item.test_image, &item.heatmap) {
            (Some(test), Some(heat)) => {
                self.local_path(test).is_some() && self.local_path(heat).is_some()
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn domain(&self, key: &str) -> Option<&DomainConfig> {
        self.domains.get(key)
    }

    #[must_use]
    pub fn accent(&self, key: &str) -> &str {
        self.branding
            .accent_colors
            .get(key)
            .map_or(DEFAULT_ACCENT, String::as_str)
    }

    #[must_use]
    pub fn hero_accent(&self) -> &str {
        self.branding
            .hero_accent
            .as_deref()
            .unwrap_or(DEFAULT_HERO_ACCENT)
    }

    #[must_use]
    pub fn hero_logo(&self) -> Option<&str> {
        self.branding
            .hero_logo
            .as_deref()
            .or(self.branding.logo.as_deref())
    }

    #[must_use]
    pub fn subtitle(&self) -> &str {
        self.branding.subtitle.as_deref().unwrap_or(DEFAULT_SUBTITLE)
    }
}

/// `#rrggbb` to a CSS `rgba(...)`, with a blue fallback for bad input.
#[must_use]
pub fn hex_to_rgba(hex: &str, alpha: f32) -> String {
    let digits = hex.trim_start_matches('#');
    let channel = |i: usize| {
        digits
            .get(i..i + 2)
            .and_then(|s| u8::from_str_radix(s, 16).ok())
    };
    match (channel(0), channel(2), channel(4)) {
        (Some(r), Some(g), Some(b)) => format!("rgba({r},{g},{b},{alpha})"),
        _ => format!("rgba(59,130,246,{alpha})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"{
        "branding": {
            "name": "VLM-Inspector",
            "logo": "assets/logo.png",
            "accent_colors": {"wildfire": "#ef4444"}
        },
        "domains": {
            "wildfire": {
                "title": "Wildfire",
                "fewshot": ["assets/w1.png", "assets/w2.png"],
                "fewshot_captions": ["Smoke plume", "Burn scar"],
                "generated": {"image": "assets/gen.png", "caption": "Synthetic fire"},
                "classification": {"test_image": "assets/test.png", "heatmap": "assets/heat.png",
                                   "predicted_class": "Rare Event", "why": "Smoke detected"}
            },
            "manufacturing": {
                "title": "Manufacturing",
                "fewshot": ["assets/m1.png"],
                "fewshot_captions": ["a", "b"],
                "generated": [{"image": "assets/g1.png"}, {}, {"caption": "text only"}],
                "classification": [{"predicted_class": "Yes"}, {"test_image": "https://example.com/x.png"}]
            },
            "crop_health": {"title": "Crop health"}
        }
    }"##;

    fn sample() -> DemoConfig {
        DemoConfig::from_json(SAMPLE, PathBuf::from("/demo")).unwrap()
    }

    #[test]
    fn domains_keep_file_order() {
        let keys: Vec<_> = sample().domains.keys().cloned().collect();
        assert_eq!(keys, vec!["wildfire", "manufacturing", "crop_health"]);
    }

    #[test]
    fn single_items_and_lists_both_parse() {
        let config = sample();
        let wildfire = config.domain("wildfire").unwrap();
        assert_eq!(wildfire.generated_items().len(), 1);
        let item = wildfire.classification_items()[0];
        assert!((item.heatmap_alpha - DEFAULT_HEATMAP_ALPHA).abs() < f32::EPSILON);
        assert_eq!(item.predicted_class, "Rare Event");

        let manufacturing = config.domain("manufacturing").unwrap();
        assert_eq!(manufacturing.generated_items().len(), 2);
        assert_eq!(manufacturing.classification_items().len(), 2);
        assert_eq!(manufacturing.classification_items()[1].predicted_class, "—");

        let crop = config.domain("crop_health").unwrap();
        assert!(crop.generated_items().is_empty());
        assert!(crop.classification_items().is_empty());
    }

    #[test]
    fn fewshot_captions_need_matching_length() {
        let config = sample();
        assert_eq!(config.domain("wildfire").unwrap().fewshot_caption(1), "Burn scar");
        assert_eq!(config.domain("manufacturing").unwrap().fewshot_caption(0), "Example 1");
    }

    #[test]
    fn paths_resolve_relative_to_config() {
        let config = sample();
        assert_eq!(config.resolve("assets/a.png"), PathBuf::from("/demo/assets/a.png"));
        assert_eq!(config.resolve("/abs/a.png"), PathBuf::from("/abs/a.png"));
    }

    #[test]
    fn missing_assets_have_no_source() {
        let config = sample();
        assert_eq!(config.image_src(Some("assets/w1.png")), None);
        assert_eq!(config.image_src(Some("assets/unregistered.png")), None);
        assert_eq!(config.image_src(None), None);
        assert_eq!(
            config.image_src(Some("https://example.com/x.png")).as_deref(),
            Some("https://example.com/x.png")
        );
    }

    #[test]
    fn existing_assets_get_stable_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/w2.png"), b"png").unwrap();
        let config = DemoConfig::from_json(SAMPLE, dir.path().to_path_buf()).unwrap();

        let src = config.image_src(Some("assets/w2.png")).unwrap();
        let id: usize = src.strip_prefix("/assets/").unwrap().parse().unwrap();
        assert_eq!(config.asset_path(id), Some(dir.path().join("assets/w2.png")));
    }

    #[test]
    fn overlay_needs_test_image_and_heatmap() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/heat.png"), b"png").unwrap();
        let config = DemoConfig::from_json(SAMPLE, dir.path().to_path_buf()).unwrap();
        let item = config.domain("wildfire").unwrap().classification_items()[0].clone();
        assert!(!config.has_overlay(&item));

        fs::write(dir.path().join("assets/test.png"), b"png").unwrap();
        assert!(config.has_overlay(&item));

        fs::remove_file(dir.path().join("assets/heat.png")).unwrap();
        assert!(!config.has_overlay(&item));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo_config.json");
        fs::write(&path, SAMPLE).unwrap();
        let config = DemoConfig::load(&path).unwrap();
        assert_eq!(config.branding.name, "VLM-Inspector");
        assert_eq!(config.resolve("x.png"), dir.path().join("x.png"));
    }

    #[test]
    fn branding_defaults() {
        let config = sample();
        assert_eq!(config.accent("wildfire"), "#ef4444");
        assert_eq!(config.accent("crop_health"), DEFAULT_ACCENT);
        assert_eq!(config.hero_accent(), DEFAULT_HERO_ACCENT);
        assert_eq!(config.hero_logo(), Some("assets/logo.png"));
        assert_eq!(config.subtitle(), DEFAULT_SUBTITLE);
    }

    #[test]
    fn hex_colors_convert() {
        assert_eq!(hex_to_rgba("#0ea5e9", 0.32), "rgba(14,165,233,0.32)");
        assert_eq!(hex_to_rgba("nope", 0.5), "rgba(59,130,246,0.5)");
    }
}
