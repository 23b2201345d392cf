#[tokio::main]
async fn main() {
    if let Err(e) = chat0::run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
