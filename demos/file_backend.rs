use std::sync::Arc;

use logshelf::init::init_tracing;
use logshelf::{capture, caller, FileStore, Logbook};
use serde::Serialize;

#[derive(Serialize)]
struct Payment {
    id: u64,
    amount_cents: u64,
    currency: &'static str,
}

struct Checkout;

impl Checkout {
    async fn charge(&self, book: &Logbook, payment: &Payment) {
        // Recorded with class `Checkout` and function `charge`.
        capture!(book, "charging card", payment);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::temp_dir().join("logshelf-demo").join("app.jsonl");
    let store = FileStore::open(&path);
    if let Some(diagnostic) = store.last_error() {
        return Err(diagnostic.to_string().into());
    }
    let book = Logbook::new(Arc::new(store), "UTC");

    book.log(caller!(), "demo started").await;
    Checkout
        .charge(&book, &Payment { id: 1, amount_cents: 4200, currency: "EUR" })
        .await;

    let page = book.search(1, 5, "eur").await;
    println!("{} matching entries in {}", page.total, path.display());
    for record in &page.records {
        println!("[{} {}] {}", record.timestamp, record.timezone, record.message);
    }

    book.clear().await?;
    Ok(())
}
