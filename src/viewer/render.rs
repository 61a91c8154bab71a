//! Server-side HTML for the demo viewer.

use super::config::{hex_to_rgba, DemoConfig, DomainConfig};
use super::session::NavState;
use std::fmt::Write;

pub const MANUFACTURING: &str = "manufacturing";
pub const CROP_HEALTH: &str = "crop_health";
pub const NO_DESCRIPTION: &str = "No description provided.";
const HOME_TILES: usize = 3;

const STYLE: &str = r"
body { font-family: system-ui, sans-serif; margin: 0; background: #f8fafc; color: #0f172a; }
main { max-width: 1200px; margin: 0 auto; padding: 1.5rem; }
img { max-width: 100%; border-radius: 8px; }
button, .button { display: block; width: 100%; padding: .5rem; margin: .4rem 0; border: 1px solid #cbd5e1;
  border-radius: 8px; background: #fff; text-align: center; text-decoration: none; color: inherit; cursor: pointer; }
button.primary { background: #0f172a; color: #fff; }
button:disabled { opacity: .5; cursor: not-allowed; }
.hero { text-align: center; margin-top: 6vh; }
.badge { border-radius: 50%; padding: 1.5rem; }
.tiles { display: grid; grid-template-columns: repeat(4, 1fr); gap: 1.5rem; margin-top: 8vh; }
.tile { text-align: center; }
.columns { display: grid; grid-template-columns: repeat(3, 1fr); gap: 1.5rem; }
.row { display: flex; gap: .75rem; }
.row > * { flex: 1; }
.status { padding: .5rem; border-radius: 8px; background: #e0f2fe; }
.status.trained { background: #dcfce7; }
.dialog-backdrop { position: fixed; inset: 0; background: rgba(15,23,42,.45); display: flex;
  align-items: center; justify-content: center; }
.dialog { background: #fff; border-radius: 12px; padding: 1.5rem; max-width: 560px; width: 90%; }
";

/// Escape text for use in HTML content and attribute values.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{}</title><style>{STYLE}</style></head><body><main>{body}</main></body></html>",
        escape(title)
    )
}

fn img(src: &str, alt: &str) -> String {
    format!("<img src=\"{}\" alt=\"{}\">", escape(src), escape(alt))
}

fn post_button(action: &str, label: &str, class: &str, enabled: bool) -> String {
    let disabled = if enabled { "" } else { " disabled" };
    format!(
        "<form method=\"post\" action=\"{}\"><button class=\"{class}\"{disabled}>{}</button></form>",
        escape(action),
        escape(label)
    )
}

fn halo(color: &str) -> String {
    format!("background: radial-gradient(closest-side, {color}, rgba(0,0,0,0) 68%);")
}

#[must_use]
pub fn render_home(config: &DemoConfig) -> String {
    let name = &config.branding.name;
    let mut html = String::new();

    let hero = config
        .image_src(config.hero_logo())
        .map_or_else(|| format!("<h1>{}</h1>", escape(name)), |src| img(&src, name));
    let _ = write!(
        html,
        "<section class=\"hero\"><div class=\"badge\" style=\"{}\">{hero}</div><p>{}</p></section>",
        halo(&hex_to_rgba(config.hero_accent(), 0.32)),
        escape(config.subtitle())
    );

    html.push_str("<section class=\"tiles\">");
    for (key, domain) in config.domains.iter().take(HOME_TILES) {
        let icon = config
            .image_src(config.branding.app_icons.get(key).map(String::as_str))
            .map_or_else(|| format!("<h3>{}</h3>", escape(&domain.title)), |src| img(&src, &domain.title));
        let _ = write!(
            html,
            "<div class=\"tile\"><div class=\"badge\" style=\"{}\">{icon}</div>\
             <a class=\"button\" href=\"/domains/{}\">{}</a></div>",
            halo(&hex_to_rgba(config.accent(key), 0.32)),
            escape(key),
            escape(&domain.title)
        );
    }
    let plus = config
        .image_src(config.branding.plus_icon.as_deref())
        .map_or_else(
            || "<div style=\"font-size:64px;line-height:1.1\">+</div>".to_string(),
            |src| img(&src, "New"),
        );
    let _ = write!(
        html,
        "<div class=\"tile\"><div class=\"badge\" style=\"{}\">{plus}</div>\
         <button disabled>+ New (coming soon)</button></div></section>",
        halo("rgba(148,163,184,.28)")
    );

    page(name, &html)
}

#[must_use]
pub fn render_domain(config: &DemoConfig, key: &str, domain: &DomainConfig, state: &NavState) -> String {
    let accent = config.accent(key);
    let trained = state.is_trained(key);
    let mut html = String::new();

    html.push_str(&post_button("/home", "← Back to home", "", true));
    let _ = write!(
        html,
        "<h2>{}</h2><hr><div class=\"columns\">",
        escape(&domain.title)
    );

    fewshot_column(&mut html, config, key, domain, accent, trained);
    generate_column(&mut html, config, key, domain, state, accent, trained);
    classify_column(&mut html, config, key, domain, state, accent, trained);
    html.push_str("</div>");

    if let Some(dialog) = &state.dialog {
        let _ = write!(
            html,
            "<div class=\"dialog-backdrop\"><div class=\"dialog\" role=\"dialog\">\
             <h3>Description</h3><p><strong>{}</strong></p><p>{}</p>{}</div></div>",
            escape(&dialog.title),
            escape(&dialog.text),
            post_button("/dialog/close", "Close", "", true)
        );
    }

    html.push_str(
        "<hr><details><summary>Demo notes &amp; tips</summary><ul>\
         <li>This is a <strong>demo-only</strong> interface. All outputs are preloaded from the \
         asset folder listed in <code>demo_config.json</code>.</li>\
         <li>Replace images and texts in the <code>assets/&lt;domain&gt;/</code> folders and edit \
         <code>demo_config.json</code> to update the demo.</li>\
         <li>The <strong>Upload image</strong> control is for realism; the classification output is \
         still the canned result.</li></ul></details>",
    );

    page(&format!("{} · {}", domain.title, config.branding.name), &html)
}

fn section_header(html: &mut String, text: &str, color: &str) {
    let _ = write!(html, "<h3 style=\"color:{}\">{}</h3>", escape(color), escape(text));
}

fn fewshot_column(
    html: &mut String,
    config: &DemoConfig,
    key: &str,
    domain: &DomainConfig,
    accent: &str,
    trained: bool,
) {
    html.push_str("<section>");
    section_header(html, "Few-shot", accent);

    if !domain.fewshot.is_empty() {
        html.push_str("<p><strong>Few-shot examples</strong></p><div class=\"row\">");
        for (i, source) in domain.fewshot.iter().enumerate() {
            html.push_str("<div>");
            if let Some(src) = config.image_src(Some(source)) {
                html.push_str(&img(&src, &domain.fewshot_caption(i)));
            }
            html.push_str(&post_button(
                &format!("/domains/{key}/describe/fewshot/{i}"),
                "Description",
                "",
                true,
            ));
            html.push_str("</div>");
        }
        html.push_str("</div>");
    }

    html.push_str(&post_button(
        &format!("/domains/{key}/train"),
        "Train Model (few-shot)",
        "primary",
        true,
    ));
    if trained {
        html.push_str("<p class=\"status trained\">Status: trained</p>");
    } else {
        html.push_str("<p class=\"status\">Status: not trained</p>");
    }
    html.push_str("</section>");
}

fn generate_column(
    html: &mut String,
    config: &DemoConfig,
    key: &str,
    domain: &DomainConfig,
    state: &NavState,
    accent: &str,
    trained: bool,
) {
    html.push_str("<section>");
    section_header(html, "Generate new samples", accent);
    html.push_str(&post_button(
        &format!("/domains/{key}/generate"),
        "Generate Image(s)",
        "",
        trained,
    ));

    if state.show_generated.contains(key) {
        let items = domain.generated_items();
        if items.is_empty() {
            html.push_str("<p class=\"status\">No generated samples configured.</p>");
        } else {
            html.push_str("<div class=\"row\">");
            for (i, item) in items.iter().enumerate() {
                html.push_str("<div>");
                if let Some(src) = config.image_src(item.image.as_deref()) {
                    html.push_str(&img(&src, "Generated sample"));
                }
                html.push_str(&post_button(
                    &format!("/domains/{key}/describe/generated/{i}"),
                    "Description",
                    "",
                    true,
                ));
                html.push_str("</div>");
            }
            html.push_str("</div>");
        }
    }
    html.push_str("</section>");
}

fn classify_column(
    html: &mut String,
    config: &DemoConfig,
    key: &str,
    domain: &DomainConfig,
    state: &NavState,
    accent: &str,
    trained: bool,
) {
    html.push_str("<section>");
    section_header(html, "Classify a new image", accent);

    let (label, multiple) = if key == CROP_HEALTH {
        ("Upload images", " multiple")
    } else {
        ("Upload image", "")
    };
    let disabled = if trained { "" } else { " disabled" };
    let _ = write!(
        html,
        "<form method=\"post\" action=\"/domains/{}/classify\" enctype=\"multipart/form-data\">\
         <label>{label} <input type=\"file\" name=\"files\" accept=\".jpg,.jpeg,.png\"{multiple}></label>\
         <button{disabled}>Classify</button></form>",
        escape(key)
    );

    if state.show_classification.contains(key) {
        classification_results(html, config, key, domain, state);
    }
    html.push_str("</section>");
}

fn classification_results(
    html: &mut String,
    config: &DemoConfig,
    key: &str,
    domain: &DomainConfig,
    state: &NavState,
) {
    let items = domain.classification_items();
    if items.is_empty() {
        html.push_str("<p class=\"status\">No classification samples configured.</p>");
        return;
    }

    let uploaded = state
        .uploaded_names
        .get(key)
        .filter(|_| key == CROP_HEALTH)
        .map_or(&[][..], Vec::as_slice);

    for (i, item) in items.iter().enumerate() {
        let extra = uploaded
            .get(i)
            .map(|name| format!(" — Uploaded: {}", escape(name)))
            .unwrap_or_default();
        let _ = write!(html, "<p><strong>Result {}{extra}</strong></p>", i + 1);

        if config.has_overlay(item) {
            let _ = write!(
                html,
                "<figure>{}<figcaption>Heatmap overlay</figcaption></figure>",
                img(&format!("/overlay/{key}/{i}"), "Heatmap overlay")
            );
        } else if let Some(src) = config.image_src(item.test_image.as_deref()) {
            html.push_str(&img(&src, "Test image"));
        }

        let why = item.why.as_deref().filter(|w| !w.is_empty());
        let (class_label, why_label) = if key == MANUFACTURING {
            if let Some(observation) = item.observation.as_deref().filter(|o| !o.is_empty()) {
                let _ = write!(html, "<p><strong>Observation</strong>: {}</p>", escape(observation));
            }
            ("Presence of fatigue cracks", "Where")
        } else {
            ("Status", "Reason")
        };
        let _ = write!(
            html,
            "<p><strong>{class_label}</strong>: {}</p>",
            escape(&item.predicted_class)
        );
        if let Some(why) = why {
            let _ = write!(html, "<p><strong>{why_label}</strong>: {}</p>", escape(why));
        }

        if i + 1 < items.len() {
            html.push_str("<hr>");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    const CONFIG: &str = r##"{
        "branding": {"name": "VLM <Inspector>", "subtitle": "Rare & unusual",
                     "app_icons": {"wildfire": "icons/wildfire.png"}},
        "domains": {
            "wildfire": {
                "title": "Wildfire",
                "fewshot": ["fs/a.png", "fs/missing.png"],
                "generated": [{"image": "gen/g.png", "caption": "Synthetic smoke"}],
                "classification": {"test_image": "cls/t.png", "heatmap": "cls/h.png",
                                   "predicted_class": "Rare Event", "why": "Smoke <plume>"}
            },
            "manufacturing": {
                "title": "Manufacturing",
                "classification": {"predicted_class": "Yes", "why": "Weld seam",
                                   "observation": "Hairline crack"}
            },
            "crop_health": {
                "title": "Crop health",
                "classification": [{"predicted_class": "Healthy"}, {"predicted_class": "Blight"}]
            },
            "flood": {"title": "Flood"}
        }
    }"##;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn fixture() -> (tempfile::TempDir, DemoConfig) {
        let dir = tempfile::tempdir().unwrap();
        for rel in ["fs/a.png", "gen/g.png", "cls/t.png", "cls/h.png", "icons/wildfire.png"] {
            touch(dir.path(), rel);
        }
        let config = DemoConfig::from_json(CONFIG, dir.path().to_path_buf()).unwrap();
        (dir, config)
    }

    fn trained(key: &str) -> NavState {
        let mut state = NavState::default();
        state.mark_trained(key);
        state
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<a href=\"x\">&'</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;");
    }

    #[test]
    fn home_shows_three_tiles_and_placeholder() {
        let (_dir, config) = fixture();
        let html = render_home(&config);
        assert!(html.contains("<h1>VLM &lt;Inspector&gt;</h1>"));
        assert!(html.contains("Rare &amp; unusual"));
        assert!(html.contains("href=\"/domains/wildfire\""));
        assert!(html.contains("href=\"/domains/crop_health\""));
        assert!(!html.contains("href=\"/domains/flood\""));
        assert!(html.contains("<button disabled>+ New (coming soon)</button>"));
        assert!(html.contains("<img src=\"/assets/"));
    }

    #[test]
    fn missing_assets_emit_no_image() {
        let (_dir, config) = fixture();
        let domain = config.domain("wildfire").unwrap();
        let html = render_domain(&config, "wildfire", domain, &NavState::default());
        assert_eq!(html.matches("<img").count(), 1);
        assert!(html.contains("/domains/wildfire/describe/fewshot/1"));
    }

    #[test]
    fn untrained_domain_disables_actions() {
        let (_dir, config) = fixture();
        let domain = config.domain("wildfire").unwrap();
        let html = render_domain(&config, "wildfire", domain, &NavState::default());
        assert!(html.contains("Status: not trained"));
        assert!(html.contains("<button class=\"\" disabled>Generate Image(s)</button>"));
        assert!(html.contains("<button disabled>Classify</button>"));
        assert!(!html.contains("Result 1"));
    }

    #[test]
    fn revealed_results_use_overlay_and_status_labels() {
        let (_dir, config) = fixture();
        let domain = config.domain("wildfire").unwrap();
        let mut state = trained("wildfire");
        state.reveal_generated("wildfire");
        state.reveal_classification("wildfire", vec![]);

        let html = render_domain(&config, "wildfire", domain, &state);
        assert!(html.contains("Status: trained"));
        assert!(html.contains("/overlay/wildfire/0"));
        assert!(html.contains("<strong>Status</strong>: Rare Event"));
        assert!(html.contains("<strong>Reason</strong>: Smoke &lt;plume&gt;"));
        assert!(html.contains("/domains/wildfire/describe/generated/0"));
    }

    #[test]
    fn missing_test_image_shows_no_overlay() {
        let (dir, config) = fixture();
        fs::remove_file(dir.path().join("cls/t.png")).unwrap();
        let domain = config.domain("wildfire").unwrap();
        let mut state = trained("wildfire");
        state.reveal_classification("wildfire", vec![]);

        let html = render_domain(&config, "wildfire", domain, &state);
        assert!(html.contains("Result 1"));
        assert!(!html.contains("/overlay/wildfire/0"));
        assert!(!html.contains("Heatmap overlay"));
        assert!(html.contains("<strong>Status</strong>: Rare Event"));
    }

    #[test]
    fn manufacturing_uses_crack_labels() {
        let (_dir, config) = fixture();
        let domain = config.domain(MANUFACTURING).unwrap();
        let mut state = trained(MANUFACTURING);
        state.reveal_classification(MANUFACTURING, vec![]);

        let html = render_domain(&config, MANUFACTURING, domain, &state);
        assert!(html.contains("<strong>Observation</strong>: Hairline crack"));
        assert!(html.contains("<strong>Presence of fatigue cracks</strong>: Yes"));
        assert!(html.contains("<strong>Where</strong>: Weld seam"));
        assert!(!html.contains("<strong>Status</strong>"));
    }

    #[test]
    fn crop_health_lists_uploaded_names() {
        let (_dir, config) = fixture();
        let domain = config.domain(CROP_HEALTH).unwrap();
        let mut state = trained(CROP_HEALTH);
        state.reveal_classification(CROP_HEALTH, vec!["leaf.jpg".into()]);

        let html = render_domain(&config, CROP_HEALTH, domain, &state);
        assert!(html.contains(" multiple>"));
        assert!(html.contains("Result 1 — Uploaded: leaf.jpg"));
        assert!(html.contains("<strong>Result 2</strong>"));
    }

    #[test]
    fn empty_sections_show_placeholders() {
        let (_dir, config) = fixture();
        let domain = config.domain("flood").unwrap();
        let mut state = trained("flood");
        state.reveal_generated("flood");
        state.reveal_classification("flood", vec![]);

        let html = render_domain(&config, "flood", domain, &state);
        assert!(html.contains("No generated samples configured."));
        assert!(html.contains("No classification samples configured."));
    }

    #[test]
    fn dialog_renders_with_close_action() {
        let (_dir, config) = fixture();
        let domain = config.domain("wildfire").unwrap();
        let mut state = NavState::default();
        state.open_dialog("Few-shot description", "Smoke & ash");

        let html = render_domain(&config, "wildfire", domain, &state);
        assert!(html.contains("role=\"dialog\""));
        assert!(html.contains("Smoke &amp; ash"));
        assert!(html.contains("action=\"/dialog/close\""));
    }
}
