//! Per-pool memory breakdown for a populated route table.
//!
//! Run with `cargo run --release --example memory_usage`.

use pathtrie::Config;
use pathtrie_router::Router;
use tikv_jemalloc_ctl::{epoch, stats};

#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let count = 50_000usize;
    let methods = ["GET", "POST", "DELETE"];
    let services = ["users", "posts", "comments", "orders", "billing", "audit"];

    let mut router: Router<u64> = Router::with_config(Config {
        capacity_hint: 1024,
        ..Config::default()
    })
    .expect("valid config");

    for i in 0..count {
        let method = methods[i % methods.len()];
        let service = services[i % services.len()];
        let shard = i / services.len();
        let template = match i % 3 {
            0 => format!("/api/{}/{}/detail", service, shard),
            1 => format!("/api/{}/{}/{{id}}", service, shard),
            _ => format!("/files/{}/{}/{{name}}.{{ext}}", service, shard),
        };
        router
            .insert(method, &template, i as u64)
            .expect("unique templates");
    }

    println!("=== Router memory ({} templates) ===\n", router.len());
    for method in router.methods().collect::<Vec<_>>() {
        let engine = router.engine(method).expect("listed method");
        println!(
            "{:<8} {:>6} templates  {:>7} nodes  {:>8} KB",
            method,
            engine.len(),
            engine.node_count(),
            engine.memory_usage() / 1024
        );
    }
    println!(
        "\nTotal:   {} KB ({:.1} bytes/template)",
        router.memory_usage() / 1024,
        router.memory_usage() as f64 / count as f64
    );

    router.finalize_all(true, false);
    println!(
        "Frozen:  {} KB (pools shrunk to fit)",
        router.memory_usage() / 1024
    );

    // Allocator-level view.
    epoch::advance().expect("jemalloc epoch");
    let allocated = stats::allocated::read().expect("jemalloc stats");
    let resident = stats::resident::read().expect("jemalloc stats");
    println!("\n=== jemalloc ===\n");
    println!("Allocated: {} KB", allocated / 1024);
    println!("Resident:  {} KB", resident / 1024);
}
