use anyhow::Error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    registryd::main().await
}
