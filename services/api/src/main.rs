use wil_api::run;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("wil-api: {err}");
        std::process::exit(1);
    }
}
