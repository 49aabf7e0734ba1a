#[tokio::main]
async fn main() {
    if let Err(error) = local_test_dashboard_lib::run().await {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}
