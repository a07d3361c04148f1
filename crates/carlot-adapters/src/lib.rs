//! Inventory scraper contract + dealer HTML and JSON fixture implementations.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use carlot_core::{RawListing, RawNumber};
use carlot_storage::{FetchError, FetchedPage, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Source of raw listings for one sync run.
#[async_trait]
pub trait InventoryScraper: Send + Sync {
    fn name(&self) -> &'static str;

    async fn scrape(
        &self,
        ctx: &AdapterContext,
        base_url: &str,
    ) -> Result<Vec<RawListing>, AdapterError>;
}

/// CSS selectors for one dealer's inventory markup. Card-level `data-*` attributes win over these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySelectors {
    pub card: String,
    pub title: String,
    pub price: String,
    pub mileage: String,
    pub vin: String,
    pub image: String,
    pub link: String,
    pub next_page: String,
}

impl Default for InventorySelectors {
    fn default() -> Self {
        Self {
            card: ".vehicle-card".into(),
            title: ".vehicle-title".into(),
            price: ".price".into(),
            mileage: ".mileage".into(),
            vin: ".vin".into(),
            image: "img".into(),
            link: "a[href]".into(),
            next_page: "a[rel=next]".into(),
        }
    }
}

struct CompiledSelectors {
    card: Selector,
    title: Selector,
    price: Selector,
    mileage: Selector,
    vin: Selector,
    image: Selector,
    link: Selector,
    next_page: Selector,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("bad selector {selector:?}: {e}")))
}

impl InventorySelectors {
    fn compile(&self) -> Result<CompiledSelectors, AdapterError> {
        Ok(CompiledSelectors {
            card: compile(&self.card)?,
            title: compile(&self.title)?,
            price: compile(&self.price)?,
            mileage: compile(&self.mileage)?,
            vin: compile(&self.vin)?,
            image: compile(&self.image)?,
            link: compile(&self.link)?,
            next_page: compile(&self.next_page)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryPage {
    pub listings: Vec<RawListing>,
    pub next_page: Option<Url>,
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_attr(card: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn data_attr(card: &ElementRef<'_>, name: &str) -> Option<String> {
    card.value()
        .attr(name)
        .and_then(|s| text_or_none(s.to_string()))
}

/// First number in display text such as `"$32,450"` or `"12,001 mi"`, without separators.
/// Later numbers (`"MSRP $31,995 Save $2,000"`) are ignored.
pub fn numeric_text(text: &str) -> Option<String> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let number = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, ',' | '.'))
        .filter(|c| *c != ',')
        .collect::<String>();
    Some(number.trim_end_matches('.').to_string())
}

fn whole_number(text: &str) -> Option<String> {
    numeric_text(text).and_then(|n| n.split('.').next().map(str::to_string))
}

fn strip_vin_label(text: &str) -> Option<String> {
    let rest = text
        .strip_prefix("VIN:")
        .or_else(|| text.strip_prefix("VIN"))
        .unwrap_or(text);
    text_or_none(rest.to_string())
}

/// Splits `"New 2024 Toyota Camry LE"` into year, make and model text. Titles that do not
/// lead with a numeric year after the condition words are not vehicle titles.
pub fn split_title(title: &str) -> Option<(String, String, String)> {
    const CONDITION_WORDS: [&str; 4] = ["new", "used", "certified", "pre-owned"];
    let mut tokens = title
        .split_whitespace()
        .skip_while(|t| CONDITION_WORDS.iter().any(|w| t.eq_ignore_ascii_case(w)));
    let year = tokens.next().filter(|t| t.bytes().all(|b| b.is_ascii_digit()))?.to_string();
    let make = tokens.next()?.to_string();
    let model = tokens.collect::<Vec<_>>().join(" ");
    if model.is_empty() {
        return None;
    }
    Some((year, make, model))
}

fn resolve(page_url: &Url, href: &str) -> Option<String> {
    page_url.join(href).ok().map(|u| u.to_string())
}

fn parse_card(card: &ElementRef<'_>, sel: &CompiledSelectors, page_url: &Url) -> Option<RawListing> {
    let title = select_text(card, &sel.title).and_then(|t| split_title(&t));
    let (title_year, title_make, title_model) = match title {
        Some((y, ma, mo)) => (Some(y), Some(ma), Some(mo)),
        None => (None, None, None),
    };

    let make = data_attr(card, "data-make").or(title_make)?;
    let model = data_attr(card, "data-model").or(title_model)?;
    let year = data_attr(card, "data-year").or(title_year).unwrap_or_default();

    let price = data_attr(card, "data-price")
        .or_else(|| select_text(card, &sel.price))
        .and_then(|t| numeric_text(&t));
    let mileage = data_attr(card, "data-mileage")
        .or_else(|| select_text(card, &sel.mileage))
        .and_then(|t| whole_number(&t));
    let vin = data_attr(card, "data-vin").or_else(|| select_text(card, &sel.vin).and_then(|t| strip_vin_label(&t)));
    let image_url = select_attr(card, &sel.image, "src")
        .or_else(|| select_attr(card, &sel.image, "data-src"))
        .and_then(|src| resolve(page_url, &src));
    let link = select_attr(card, &sel.link, "href").and_then(|href| resolve(page_url, &href));

    Some(RawListing {
        make,
        model,
        year: RawNumber::Text(year),
        price: price.map(RawNumber::Text),
        mileage: mileage.map(RawNumber::Text),
        vin,
        image_url,
        link,
    })
}

/// Extracts every vehicle card on one inventory page plus the `rel=next` link, if any.
pub fn parse_inventory_page(
    html: &str,
    page_url: &Url,
    selectors: &InventorySelectors,
) -> Result<InventoryPage, AdapterError> {
    let sel = selectors.compile()?;
    let document = Html::parse_document(html);

    let mut listings = Vec::new();
    for (idx, card) in document.select(&sel.card).enumerate() {
        match parse_card(&card, &sel, page_url) {
            Some(listing) => listings.push(listing),
            None => warn!(page = %page_url, card = idx, "skipping vehicle card without make/model"),
        }
    }

    let next_page = document
        .select(&sel.next_page)
        .next()
        .and_then(|n| n.value().attr("href"))
        .and_then(|href| page_url.join(href).ok());

    Ok(InventoryPage { listings, next_page })
}

/// Where dealer pages come from. [`HttpFetcher`] in production.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_text(run_id, url).await
    }
}

/// Scrapes a dealer's paginated inventory listing, following `rel=next` up to `max_pages`.
pub struct DealerInventoryScraper<F = HttpFetcher> {
    fetcher: F,
    selectors: InventorySelectors,
    max_pages: usize,
}

impl<F: PageFetcher> DealerInventoryScraper<F> {
    pub fn new(fetcher: F, max_pages: usize) -> Self {
        Self {
            fetcher,
            selectors: InventorySelectors::default(),
            max_pages: max_pages.max(1),
        }
    }
}

#[async_trait]
impl<F: PageFetcher> InventoryScraper for DealerInventoryScraper<F> {
    fn name(&self) -> &'static str {
        "dealer-html"
    }

    async fn scrape(
        &self,
        ctx: &AdapterContext,
        base_url: &str,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut next = Some(Url::parse(base_url).map_err(|e| {
            AdapterError::Message(format!("invalid inventory url {base_url}: {e}"))
        })?);
        let mut visited = HashSet::new();
        let mut listings = Vec::new();

        while let Some(url) = next.take() {
            if visited.len() >= self.max_pages || !visited.insert(url.clone()) {
                break;
            }
            let fetched = self.fetcher.fetch_page(ctx.run_id, url.as_str()).await?;
            let page_url = Url::parse(&fetched.final_url).unwrap_or(url);
            let page = parse_inventory_page(&fetched.body, &page_url, &self.selectors)?;
            debug!(page = %page_url, listings = page.listings.len(), "parsed inventory page");
            listings.extend(page.listings);
            next = page.next_page;
        }

        Ok(listings)
    }
}

/// Reads listings from a JSON array on disk instead of the network.
#[derive(Debug, Clone)]
pub struct FixtureInventoryScraper {
    path: PathBuf,
}

impl FixtureInventoryScraper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InventoryScraper for FixtureInventoryScraper {
    fn name(&self) -> &'static str {
        "json-fixture"
    }

    async fn scrape(
        &self,
        _ctx: &AdapterContext,
        _base_url: &str,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let listings = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="vehicle-card" data-make="Toyota" data-model="Camry" data-year="2023"
               data-price="28450" data-vin="4T1C11AK5PU000001">
            <h2 class="vehicle-title">2023 Toyota Camry</h2>
            <img src="/photos/camry.jpg">
            <a href="/inventory/camry-1">Details</a>
          </div>
          <div class="vehicle-card">
            <h2 class="vehicle-title">New 2024 Honda Civic Sport Touring</h2>
            <span class="price">MSRP $31,995</span>
            <span class="mileage">12 mi</span>
            <span class="vin">VIN: 2HGFE1F97RH000002</span>
            <img data-src="https://cdn.example.com/civic.jpg">
            <a href="https://dealer.example.com/inventory/civic-2">Details</a>
          </div>
          <div class="vehicle-card"><h2 class="vehicle-title">Call for availability</h2></div>
          <a rel="next" href="?page=2">Next</a>
        </body></html>
    "#;

    fn page_url() -> Url {
        Url::parse("https://dealer.example.com/inventory/new-cars/").unwrap()
    }

    #[test]
    fn parses_cards_from_data_attributes_and_text() {
        let page = parse_inventory_page(PAGE, &page_url(), &InventorySelectors::default()).unwrap();
        assert_eq!(page.listings.len(), 2);

        let camry = &page.listings[0];
        assert_eq!(camry.make, "Toyota");
        assert_eq!(camry.year, RawNumber::Text("2023".into()));
        assert_eq!(camry.price, Some(RawNumber::Text("28450".into())));
        assert_eq!(camry.mileage, None);
        assert_eq!(camry.vin.as_deref(), Some("4T1C11AK5PU000001"));
        assert_eq!(
            camry.image_url.as_deref(),
            Some("https://dealer.example.com/photos/camry.jpg")
        );
        assert_eq!(
            camry.link.as_deref(),
            Some("https://dealer.example.com/inventory/camry-1")
        );

        let civic = &page.listings[1];
        assert_eq!(civic.make, "Honda");
        assert_eq!(civic.model, "Civic Sport Touring");
        assert_eq!(civic.year, RawNumber::Text("2024".into()));
        assert_eq!(civic.price, Some(RawNumber::Text("31995".into())));
        assert_eq!(civic.mileage, Some(RawNumber::Text("12".into())));
        assert_eq!(civic.vin.as_deref(), Some("2HGFE1F97RH000002"));
        assert_eq!(civic.image_url.as_deref(), Some("https://cdn.example.com/civic.jpg"));
    }

    #[test]
    fn next_page_link_is_resolved_against_page_url() {
        let page = parse_inventory_page(PAGE, &page_url(), &InventorySelectors::default()).unwrap();
        assert_eq!(
            page.next_page.unwrap().as_str(),
            "https://dealer.example.com/inventory/new-cars/?page=2"
        );
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = InventorySelectors {
            card: "div[".into(),
            ..Default::default()
        };
        let err = parse_inventory_page(PAGE, &page_url(), &selectors).unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn numeric_text_strips_currency_and_separators() {
        assert_eq!(numeric_text("$32,450.00").as_deref(), Some("32450.00"));
        assert_eq!(numeric_text("12,001 mi.").as_deref(), Some("12001"));
        assert_eq!(numeric_text("MSRP $31,995 Save $2,000").as_deref(), Some("31995"));
        assert_eq!(numeric_text("Call for price"), None);
    }

    #[test]
    fn fractional_mileage_keeps_the_whole_miles() {
        let html = r#"
            <div class="vehicle-card">
              <h2 class="vehicle-title">Used 2019 Honda Civic EX</h2>
              <span class="price">$17,250.00</span>
              <span class="mileage">48,310.5 mi</span>
            </div>
        "#;
        let page = parse_inventory_page(html, &page_url(), &InventorySelectors::default()).unwrap();
        assert_eq!(page.listings[0].mileage, Some(RawNumber::Text("48310".into())));

        let car = page.listings[0].to_new_car().unwrap();
        assert_eq!(car.mileage, 48310);
        assert_eq!(car.price, 17250.0);
    }

    /// Serves canned HTML keyed by URL and records every request.
    struct CannedPages {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl CannedPages {
        fn new(pages: &[(&str, String)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(url, html)| (url.to_string(), html.clone()))
                    .collect(),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for &CannedPages {
        async fn fetch_page(&self, _run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(body) => Ok(FetchedPage {
                    final_url: url.to_string(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn inventory_page(vin: &str, next: Option<&str>) -> String {
        let next = next
            .map(|href| format!(r#"<a rel="next" href="{href}">Next</a>"#))
            .unwrap_or_default();
        format!(
            r#"<div class="vehicle-card" data-make="Kia" data-model="Soul" data-year="2021"
                    data-vin="{vin}"></div>{next}"#
        )
    }

    const PAGE_1: &str = "https://dealer.example.com/inventory/?page=1";
    const PAGE_2: &str = "https://dealer.example.com/inventory/?page=2";
    const PAGE_3: &str = "https://dealer.example.com/inventory/?page=3";

    #[tokio::test]
    async fn pagination_stops_at_max_pages() {
        let pages = CannedPages::new(&[
            (PAGE_1, inventory_page("K1", Some("?page=2"))),
            (PAGE_2, inventory_page("K2", Some("?page=3"))),
            (PAGE_3, inventory_page("K3", None)),
        ]);
        let ctx = AdapterContext { run_id: Uuid::new_v4() };

        let listings = DealerInventoryScraper::new(&pages, 2)
            .scrape(&ctx, PAGE_1)
            .await
            .unwrap();
        let vins = listings.iter().filter_map(|l| l.vin()).collect::<Vec<_>>();
        assert_eq!(vins, ["K1", "K2"]);
        assert_eq!(pages.requested(), [PAGE_1, PAGE_2]);
    }

    #[tokio::test]
    async fn next_link_back_to_a_visited_page_ends_the_crawl() {
        let pages = CannedPages::new(&[
            (PAGE_1, inventory_page("K1", Some("?page=2"))),
            (PAGE_2, inventory_page("K2", Some("?page=1"))),
        ]);
        let ctx = AdapterContext { run_id: Uuid::new_v4() };

        let listings = DealerInventoryScraper::new(&pages, 10)
            .scrape(&ctx, PAGE_1)
            .await
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(pages.requested(), [PAGE_1, PAGE_2]);
    }

    #[tokio::test]
    async fn missing_page_fails_the_scrape() {
        let pages = CannedPages::new(&[(PAGE_1, inventory_page("K1", Some("?page=2")))]);
        let ctx = AdapterContext { run_id: Uuid::new_v4() };

        let err = DealerInventoryScraper::new(&pages, 10)
            .scrape(&ctx, PAGE_1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Fetch(FetchError::HttpStatus { status: 404, .. })));
    }

    #[test]
    fn title_split_skips_condition_words() {
        assert_eq!(
            split_title("Certified Pre-Owned 2021 Ford F-150 XLT"),
            Some(("2021".into(), "Ford".into(), "F-150 XLT".into()))
        );
        assert_eq!(split_title("2022 Mazda"), None);
    }

    #[tokio::test]
    async fn fixture_scraper_reads_json_listings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(
            &path,
            r#"[{"make":"Kia","model":"Soul","year":"2021","price":"18999","vin":"KNDJ1"}]"#,
        )
        .unwrap();

        let scraper = FixtureInventoryScraper::new(&path);
        let ctx = AdapterContext { run_id: Uuid::new_v4() };
        let listings = scraper.scrape(&ctx, "ignored").await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].vin.as_deref(), Some("KNDJ1"));
        assert_eq!(listings[0].mileage, None);
    }
}
