use std::path::{Path, PathBuf};

use carlot_adapters::{
    parse_inventory_page, AdapterContext, FixtureInventoryScraper, InventoryScraper,
    InventorySelectors,
};
use carlot_core::RawNumber;
use reqwest::Url;
use uuid::Uuid;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[test]
fn dealer_inventory_page_fixture_parses() {
    let html = std::fs::read_to_string(fixtures_dir().join("dealer-inventory/page1.html"))
        .expect("read page fixture");
    let page_url = Url::parse("https://dealer.example.com/inventory/new-cars/").unwrap();

    let page = parse_inventory_page(&html, &page_url, &InventorySelectors::default()).unwrap();
    assert_eq!(page.listings.len(), 3);

    let camry = &page.listings[0];
    assert_eq!((camry.make.as_str(), camry.model.as_str()), ("Toyota", "Camry LE"));
    assert_eq!(camry.year, RawNumber::Text("2024".into()));
    assert_eq!(camry.vin(), Some("4T1C11AK5RU123456"));
    assert_eq!(
        camry.image_url.as_deref(),
        Some("https://dealer.example.com/photos/camry-le.jpg")
    );
    assert_eq!(
        camry.link.as_deref(),
        Some("https://dealer.example.com/inventory/new-2024-toyota-camry-le/")
    );

    let civic = page.listings[1].to_new_car().unwrap();
    assert_eq!(civic.year, 2019);
    assert_eq!(civic.price, 17250.0);
    assert_eq!(civic.mileage, 48310);
    assert_eq!(civic.vin.as_deref(), Some("2HGFC2F59KH512345"));
    assert_eq!(
        civic.image_url.as_deref(),
        Some("https://dealer.example.com/photos/civic-ex.jpg")
    );

    let truck = page.listings[2].to_new_car().unwrap();
    assert_eq!((truck.make.as_str(), truck.model.as_str(), truck.year), ("Ford", "F-150", 2023));
    assert_eq!(truck.price, 51990.0);
    assert_eq!(truck.mileage, 0);
    assert!(truck.vin.is_none());

    assert_eq!(
        page.next_page.map(|u| u.to_string()),
        Some("https://dealer.example.com/inventory/new-cars/?page=2".to_string())
    );
}

#[tokio::test]
async fn json_inventory_fixture_loads_mixed_number_shapes() {
    let scraper = FixtureInventoryScraper::new(fixtures_dir().join("inventory.json"));
    let ctx = AdapterContext { run_id: Uuid::new_v4() };

    let listings = scraper.scrape(&ctx, "unused").await.unwrap();
    assert_eq!(listings.len(), 3);

    let cars = listings
        .iter()
        .map(|l| l.to_new_car())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(cars[0].year, 2024);
    assert_eq!(cars[1].price, 17250.0);
    assert_eq!(cars[1].mileage, 48310);
    assert_eq!(cars[2].vin, None);
    assert_eq!(cars[2].mileage, 0);
}
