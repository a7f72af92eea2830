use anyhow::anyhow;
use docnow_server::auth::hash_password;

fn main() -> anyhow::Result<()> {
    let password = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("Usage: hashpass <password>"))?;
    let phc = hash_password(&password).map_err(|e| anyhow!(e))?;
    println!("{phc}");
    Ok(())
}
