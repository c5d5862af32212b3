//! # Seed Data Generator
//!
//! Populates the database with demo discount codes and gift cards for
//! development.
//!
//! ## Usage
//! ```bash
//! # Seed ./cartwright_dev.db (default)
//! cargo run -p cartwright-db --bin seed
//!
//! # Specify database path
//! cargo run -p cartwright-db --bin seed -- --db ./data/cartwright.db
//! ```
//!
//! ## Generated Data
//! - `TEN`       10% off the whole cart, US region
//! - `FIVEOFF`   5.00 off the whole cart, US region
//! - `SHOES20`   20% off items in the shoes collection, US region
//! - `FREESHIP`  free shipping, US and EU regions
//! - `GIFT-25` / `GIFT-100` gift cards for the US region

use std::env;

use chrono::{Duration, Utc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cartwright_core::{
    new_id, AllocationType, Discount, DiscountCondition, DiscountConditionOperator,
    DiscountConditionType, DiscountRule, DiscountRuleType, GiftCard, Metadata,
};
use cartwright_db::{Database, DbConfig, DiscountRepository, GiftCardRepository};

/// (code, type, value, regions)
const DISCOUNTS: &[(&str, DiscountRuleType, i64, &[&str])] = &[
    ("TEN", DiscountRuleType::Percentage, 1000, &["reg_us"]),
    ("FIVEOFF", DiscountRuleType::Fixed, 500, &["reg_us"]),
    ("SHOES20", DiscountRuleType::Percentage, 2000, &["reg_us"]),
    ("FREESHIP", DiscountRuleType::FreeShipping, 0, &["reg_us", "reg_eu"]),
];

/// (code, value)
const GIFT_CARDS: &[(&str, i64)] = &[("GIFT-25", 2_500), ("GIFT-100", 10_000)];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut db_path = String::from("./cartwright_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Cartwright Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>    Database file path (default: ./cartwright_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, "Seeding database");

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let mut conn = db.pool().acquire().await?;

    let mut created = 0;
    for (code, rule_type, value, regions) in DISCOUNTS {
        if DiscountRepository::get_by_code(&mut conn, code).await?.is_some() {
            warn!(code, "Discount already exists, skipping");
            continue;
        }
        let discount = demo_discount(code, *rule_type, *value, regions);
        DiscountRepository::insert(&mut conn, &discount).await?;
        created += 1;
    }

    for (code, value) in GIFT_CARDS {
        if GiftCardRepository::get_by_code(&mut conn, code).await?.is_some() {
            warn!(code, "Gift card already exists, skipping");
            continue;
        }
        let card = GiftCard {
            id: new_id(),
            code: (*code).to_string(),
            value: *value,
            balance: *value,
            region_id: "reg_us".to_string(),
            is_disabled: false,
            ends_at: None,
            created_at: Utc::now(),
        };
        GiftCardRepository::insert(&mut conn, &card).await?;
        created += 1;
    }

    info!(created, "Seed complete");
    Ok(())
}

/// Builds a demo discount that started yesterday and never expires.
fn demo_discount(code: &str, rule_type: DiscountRuleType, value: i64, regions: &[&str]) -> Discount {
    let now = Utc::now();
    let rule_id = new_id();

    let conditions = if code == "SHOES20" {
        vec![DiscountCondition {
            id: new_id(),
            rule_id: rule_id.clone(),
            condition_type: DiscountConditionType::ProductCollections,
            operator: DiscountConditionOperator::In,
            resource_ids: vec!["pcol_shoes".to_string()],
        }]
    } else {
        Vec::new()
    };

    Discount {
        id: new_id(),
        code: code.to_string(),
        is_dynamic: false,
        is_disabled: false,
        parent_discount_id: None,
        rule: DiscountRule {
            id: rule_id,
            rule_type,
            value,
            allocation: AllocationType::Total,
            description: Some(format!("Demo discount {code}")),
            conditions,
        },
        regions: regions.iter().map(|r| r.to_string()).collect(),
        starts_at: now - Duration::days(1),
        ends_at: None,
        usage_limit: None,
        usage_count: 0,
        metadata: Metadata::new(),
        created_at: now,
        updated_at: now,
    }
}
