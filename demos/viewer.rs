//! Minimal viewer over whichever backend the environment selects.
//!
//! ```text
//! LOGSHELF_STORAGE_TYPE=file LOGSHELF_FILE_PATH=/tmp/app.jsonl \
//!     cargo run --example viewer -- search timeout 1
//! cargo run --example viewer -- clear
//! ```

use logshelf::init::init_tracing;
use logshelf::{Logbook, Settings};

const PAGE_SIZE: u32 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let settings = match std::env::var("LOGSHELF_CONFIG") {
        Ok(path) => Settings::load(path.as_ref())?,
        Err(_) => Settings::from_env()?,
    };
    let book = Logbook::open(&settings).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("clear") => match book.clear().await {
            Ok(()) => println!("{}", serde_json::json!({"ok": true})),
            Err(e) => println!("{}", serde_json::json!({"error": e.to_string()})),
        },
        Some("search") | None => {
            let term = args.get(1).map(String::as_str).unwrap_or("");
            let page = args.get(2).and_then(|p| p.parse().ok()).unwrap_or(1);
            let result = book.search(page, PAGE_SIZE, term).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            eprintln!("page {} of {}", page, result.total_pages(PAGE_SIZE).max(1));
        }
        Some(other) => return Err(format!("unknown command {:?}", other).into()),
    }

    Ok(())
}
