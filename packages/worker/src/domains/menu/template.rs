//! Template layer: turns a snapshot into self-contained HTML.
//!
//! Renders are CSS-only by contract; the markup produced here carries no
//! scripts, and every image URL is checked against the content allowlist
//! before it is emitted. Output is deterministic for a fixed snapshot.

use std::fmt::Write as _;

use thiserror::Error;

use crate::kernel::render::UrlPolicy;

use super::snapshot::{MenuItem, Orientation, RenderSnapshot};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("untrusted image url: {0}")]
    UntrustedImageUrl(String),
}

/// Pure snapshot-to-HTML collaborator. Deterministic for fixed inputs.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, snapshot: &RenderSnapshot) -> Result<String, TemplateError>;
}

/// Built-in menu layouts, keyed by the snapshot's `template_id`.
pub struct MenuTemplateRenderer {
    policy: UrlPolicy,
}

const TEMPLATE_IDS: &[&str] = &["classic", "modern", "compact"];

impl MenuTemplateRenderer {
    pub fn new(policy: UrlPolicy) -> Self {
        Self { policy }
    }

    fn stylesheet(template_id: &str, snapshot: &RenderSnapshot) -> String {
        let landscape = snapshot.export_options.orientation == Orientation::Landscape;
        let page_size = match (snapshot.export_options.format, landscape) {
            (fmt, false) => format!("{fmt:?}"),
            (fmt, true) => format!("{fmt:?} landscape"),
        };

        let family = match template_id {
            "classic" => "Georgia, 'Times New Roman', serif",
            "modern" => "'Helvetica Neue', Arial, sans-serif",
            _ => "Arial, sans-serif",
        };
        let item_spacing = if template_id == "compact" { "2px 0" } else { "8px 0" };

        format!(
            "@page {{ size: {page_size}; margin: 1cm; }}\n\
             body {{ font-family: {family}; color: #1a1a1a; margin: 0; }}\n\
             h1 {{ text-align: center; margin: 12px 0 20px; }}\n\
             h2 {{ border-bottom: 1px solid #999; padding-bottom: 4px; margin: 18px 0 8px; }}\n\
             .item {{ margin: {item_spacing}; }}\n\
             .item .row {{ display: flex; justify-content: space-between; }}\n\
             .item .name {{ font-weight: bold; }}\n\
             .item .desc {{ font-size: 0.9em; color: #444; }}\n\
             .item .extras {{ font-size: 0.85em; color: #555; margin-left: 12px; }}\n\
             .indicators {{ font-size: 0.8em; color: #2a6f2a; margin-left: 6px; }}\n\
             img.item-photo {{ max-width: 140px; max-height: 100px; object-fit: cover; }}"
        )
    }

    fn push_item(
        &self,
        html: &mut String,
        item: &MenuItem,
        currency: &str,
        include_images: bool,
        include_prices: bool,
    ) -> Result<(), TemplateError> {
        html.push_str("<div class=\"item\"><div class=\"row\"><span class=\"name\">");
        html.push_str(&escape(&item.name));
        if !item.indicators.is_empty() {
            let _ = write!(
                html,
                "<span class=\"indicators\">{}</span>",
                escape(&item.indicators.join(" · "))
            );
        }
        html.push_str("</span>");
        if include_prices {
            if let Some(price) = item.price {
                let _ = write!(html, "<span class=\"price\">{}</span>", money(price, currency));
            }
        }
        html.push_str("</div>");

        if let Some(desc) = &item.description {
            let _ = write!(html, "<div class=\"desc\">{}</div>", escape(desc));
        }

        if include_images {
            if let Some(url) = &item.image_url {
                if !self.policy.allows(url) {
                    return Err(TemplateError::UntrustedImageUrl(url.clone()));
                }
                let _ = write!(html, "<img class=\"item-photo\" src=\"{}\">", escape(url));
            }
        }

        for variant in &item.variants {
            let _ = write!(html, "<div class=\"extras\">{}", escape(&variant.name));
            if include_prices {
                if let Some(price) = variant.price {
                    let _ = write!(html, " — {}", money(price, currency));
                }
            }
            html.push_str("</div>");
        }
        for modifier in &item.modifiers {
            let _ = write!(html, "<div class=\"extras\">+ {}", escape(&modifier.name));
            if include_prices {
                if let Some(delta) = modifier.price_delta {
                    let _ = write!(html, " ({})", money(delta, currency));
                }
            }
            html.push_str("</div>");
        }

        html.push_str("</div>");
        Ok(())
    }
}

impl TemplateRenderer for MenuTemplateRenderer {
    fn render(&self, snapshot: &RenderSnapshot) -> Result<String, TemplateError> {
        let template_id = snapshot.template_id.as_str();
        if !TEMPLATE_IDS.contains(&template_id) {
            return Err(TemplateError::UnknownTemplate(template_id.to_string()));
        }

        let menu = &snapshot.menu_data;
        let currency = menu.currency.as_deref().unwrap_or("");
        let include_images = snapshot.export_options.include_images;
        let include_prices = snapshot.export_options.include_prices;

        let mut html = String::with_capacity(4096);
        html.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\"><style>");
        html.push_str(&Self::stylesheet(template_id, snapshot));
        html.push_str("</style></head><body>");
        let _ = write!(html, "<h1>{}</h1>", escape(&menu.name));

        let mut categories = menu.categories.clone();
        categories.sort_by_key(|c| c.sort_order);

        let mut placed = vec![false; menu.items.len()];
        for category in &categories {
            let section: Vec<usize> = menu
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.category.as_deref() == Some(category.name.as_str()))
                .map(|(i, _)| i)
                .collect();
            if section.is_empty() {
                continue;
            }
            let _ = write!(html, "<h2>{}</h2>", escape(&category.name));
            for i in section {
                placed[i] = true;
                self.push_item(&mut html, &menu.items[i], currency, include_images, include_prices)?;
            }
        }

        // Items with no (or unlisted) category land in a trailing section.
        let stragglers: Vec<&MenuItem> = menu
            .items
            .iter()
            .zip(&placed)
            .filter(|(_, placed)| !**placed)
            .map(|(item, _)| item)
            .collect();
        if !stragglers.is_empty() {
            for item in stragglers {
                self.push_item(&mut html, item, currency, include_images, include_prices)?;
            }
        }

        html.push_str("</body></html>");
        Ok(html)
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
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

fn money(amount: f64, currency: &str) -> String {
    if currency.is_empty() {
        format!("{amount:.2}")
    } else {
        format!("{amount:.2} {currency}")
    }
}
