//! Product tile extraction from listing page HTML.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::crawler::task::CandidateProduct;

const TILE_SELECTOR: &str = ".product-item, .product, .item, .goods-item";
const NAME_SELECTOR: &str = ".product-name, .product-title, .name, .title";
const PRICE_SELECTOR: &str = ".price, .product-price, .current-price";

/// First decimal number of the price text; a range yields its lower bound
const PRICE_PATTERN: &str = r"\d+(?:\.\d+)?|\.\d+";

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector '{}': {:?}", css, e))
}

/// Heuristic product extractor for common listing markup
#[derive(Debug, Clone)]
pub struct ProductExtractor {
    tile: Selector,
    name: Selector,
    price: Selector,
    image: Selector,
    link: Selector,
    price_number: Regex,
}

impl ProductExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tile: parse_selector(TILE_SELECTOR)?,
            name: parse_selector(NAME_SELECTOR)?,
            price: parse_selector(PRICE_SELECTOR)?,
            image: parse_selector("img")?,
            link: parse_selector("a")?,
            price_number: Regex::new(PRICE_PATTERN).context("Invalid price pattern")?,
        })
    }

    /// Extract candidate products from a listing page.
    ///
    /// Tiles without a name or a parseable price are skipped. `site_config`
    /// is accepted for per-site overrides but the generic selectors are used
    /// for every site.
    pub fn extract(
        &self,
        html: &str,
        page_url: &Url,
        _site_config: Option<&Value>,
    ) -> Vec<CandidateProduct> {
        let document = Html::parse_document(html);
        let source_site = page_url.host_str().unwrap_or_default().to_string();

        let products: Vec<CandidateProduct> = document
            .select(&self.tile)
            .filter_map(|tile| self.extract_tile(tile, page_url, &source_site))
            .collect();

        debug!("Extracted {} candidates from {}", products.len(), page_url);
        products
    }

    fn extract_tile(
        &self,
        tile: ElementRef<'_>,
        page_url: &Url,
        source_site: &str,
    ) -> Option<CandidateProduct> {
        let name = tile.select(&self.name).next().map(element_text)?;
        if name.is_empty() {
            return None;
        }

        let price_text = tile.select(&self.price).next().map(element_text)?;
        let price = self.parse_price(&price_text)?;

        let image = match tile.select(&self.image).next().and_then(image_source) {
            Some(src) => Some(page_url.join(src).ok()?.to_string()),
            None => None,
        };

        let href = tile
            .select(&self.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|href| !href.is_empty());
        let external_url = match href {
            Some(href) => page_url.join(href).ok()?.to_string(),
            None => page_url.to_string(),
        };

        Some(CandidateProduct {
            name,
            price,
            image,
            external_url,
            source_site: source_site.to_string(),
            category: None,
        })
    }

    /// Keep digits, dots and range separators, then parse the first number.
    /// `None` when the text holds no digits.
    pub fn parse_price(&self, text: &str) -> Option<f64> {
        let normalized: String = text
            .chars()
            .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '~'))
            .collect();

        self.price_number
            .find(&normalized)?
            .as_str()
            .parse::<f64>()
            .ok()
            .filter(|price| price.is_finite() && *price >= 0.0)
    }
}

/// Trimmed text of an element with inner whitespace collapsed
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lazy-load `data-src` wins over `src`
fn image_source<'a>(img: ElementRef<'a>) -> Option<&'a str> {
    let value = img.value();
    [value.attr("data-src"), value.attr("src")]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|src| !src.is_empty())
}
