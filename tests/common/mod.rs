#![allow(dead_code)]

use escrow_ledger::application::marketplace::{Marketplace, Stores};
use escrow_ledger::application::orders::{NewOrder, Request};
use escrow_ledger::config::Settings;
use escrow_ledger::domain::actor::{Actor, UserId};
use escrow_ledger::domain::order::Order;
use escrow_ledger::domain::package::{PackageId, ServicePackage};
use escrow_ledger::domain::wallet::WalletId;
use escrow_ledger::infrastructure::in_memory::InMemoryPackageCatalog;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const CUSTOMER: &str = "cust-1";
pub const PROVIDER: &str = "prov-1";
pub const PACKAGE: &str = "pkg-1";

pub fn marketplace(settings: &Settings) -> Marketplace {
    marketplace_over(Stores::in_memory(), settings)
}

pub fn marketplace_over(stores: Stores, settings: &Settings) -> Marketplace {
    let catalog = InMemoryPackageCatalog::with_packages([
        ServicePackage::new(PACKAGE, PROVIDER).with_delivery_days(3),
        ServicePackage::new("pkg-2", "prov-2"),
        ServicePackage::new("pkg-rush", PROVIDER).with_delivery_days(0),
    ]);
    Marketplace::new(stores, Arc::new(catalog), settings)
}

pub fn customer() -> Request {
    Request::new(Actor::customer(CUSTOMER))
}

pub fn provider() -> Request {
    Request::new(Actor::provider(PROVIDER))
}

pub fn admin() -> Request {
    Request::new(Actor::admin("ops-1"))
}

pub fn wallet(provider: &str) -> WalletId {
    WalletId::for_provider(&UserId::new(provider))
}

pub fn new_order(price: i64) -> NewOrder {
    NewOrder {
        customer: UserId::new(CUSTOMER),
        provider: UserId::new(PROVIDER),
        package: PackageId::new(PACKAGE),
        price,
    }
}

pub async fn create(market: &Marketplace, price: i64) -> Order {
    market.orders.create(&customer(), new_order(price)).await.unwrap()
}

pub async fn delivered(market: &Marketplace, price: i64) -> Order {
    let order = create(market, price).await;
    market.orders.accept(&provider(), order.id).await.unwrap();
    market
        .orders
        .deliver(&provider(), order.id, "s3://deliverables/final.zip")
        .await
        .unwrap()
}

/// `available + pending == sum(amount)` for every wallet.
pub async fn assert_balanced(market: &Marketplace) {
    for wallet in market.ledger.wallets().await.unwrap() {
        let reconciliation = market.ledger.reconcile(&wallet.id).await.unwrap();
        assert!(
            reconciliation.is_balanced(),
            "wallet {} drifted: {:?}",
            wallet.id,
            reconciliation
        );
        assert!(!wallet.available.is_negative() && !wallet.pending.is_negative());
    }
}

pub fn commands_csv(rows: &[&str]) -> NamedTempFile {
    let mut csv = NamedTempFile::new().unwrap();
    writeln!(csv, "op,order,actor,package,amount,key,note").unwrap();
    for row in rows {
        writeln!(csv, "{row}").unwrap();
    }
    csv
}
