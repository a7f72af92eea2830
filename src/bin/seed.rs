//! Seeds a fresh database with a starter catalog, a welcome promo, default
//! platform settings and a super-admin account. Safe to run repeatedly.

use anyhow::{Context, anyhow};
use clap::Parser;
use serde_json::json;
use sqlx::PgConnection;
use uuid::Uuid;

use docnow_server::{
    auth::{generate_referral_code, hash_password},
    config::Config,
    db,
    models::ROLE_SUPER_ADMIN,
    pricing::DiscountType,
    settings::{KEY_MAX_WALLET_USAGE, KEY_REFEREE_REWARD, KEY_REFERRER_REWARD, PlatformSettings},
    validation::slugify,
    wallet,
};

#[derive(Debug, Parser)]
#[command(about = "Seed catalog, promos, settings and a super admin")]
struct Args {
    #[arg(long, env = "SEED_ADMIN_EMAIL", default_value = "admin@docnow.local")]
    admin_email: String,
    /// Required to create the admin; ignored when the account exists.
    #[arg(long, env = "SEED_ADMIN_PASSWORD")]
    admin_password: Option<String>,
    #[arg(long, default_value = "DocNow Admin")]
    admin_name: String,
}

struct SeedProduct {
    partner_code: &'static str,
    name: &'static str,
    category: &'static str,
    product_type: i16,
    sample_type: &'static str,
    fasting: bool,
    tat_hours: i32,
    mrp_paise: i64,
    price_paise: i64,
    popular: bool,
}

const CATEGORIES: [&str; 4] = ["Full Body Checkups", "Diabetes", "Thyroid", "Vitamins"];

const PRODUCTS: &[SeedProduct] = &[
    SeedProduct {
        partner_code: "PKG-FBC-01",
        name: "Full Body Checkup Essential",
        category: "Full Body Checkups",
        product_type: 1,
        sample_type: "Blood, Urine",
        fasting: true,
        tat_hours: 24,
        mrp_paise: 399_900,
        price_paise: 149_900,
        popular: true,
    },
    SeedProduct {
        partner_code: "TST-HBA1C",
        name: "HbA1c",
        category: "Diabetes",
        product_type: 0,
        sample_type: "Blood",
        fasting: false,
        tat_hours: 12,
        mrp_paise: 60_000,
        price_paise: 39_900,
        popular: true,
    },
    SeedProduct {
        partner_code: "TST-FBS",
        name: "Fasting Blood Sugar",
        category: "Diabetes",
        product_type: 0,
        sample_type: "Blood",
        fasting: true,
        tat_hours: 12,
        mrp_paise: 15_000,
        price_paise: 9_900,
        popular: false,
    },
    SeedProduct {
        partner_code: "TST-TSH",
        name: "Thyroid Profile (T3, T4, TSH)",
        category: "Thyroid",
        product_type: 0,
        sample_type: "Blood",
        fasting: false,
        tat_hours: 24,
        mrp_paise: 80_000,
        price_paise: 44_900,
        popular: true,
    },
    SeedProduct {
        partner_code: "TST-VITD",
        name: "Vitamin D (25-OH)",
        category: "Vitamins",
        product_type: 0,
        sample_type: "Blood",
        fasting: false,
        tat_hours: 24,
        mrp_paise: 140_000,
        price_paise: 79_900,
        popular: false,
    },
];

async fn seed_catalog(conn: &mut PgConnection) -> anyhow::Result<()> {
    for (i, name) in CATEGORIES.into_iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO category (name, slug, sort_order)
            VALUES ($1, $2, $3)
            ON CONFLICT (slug) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(slugify(name))
        .bind(i as i32)
        .execute(&mut *conn)
        .await?;
    }

    for p in PRODUCTS {
        let category_id: Uuid = sqlx::query_scalar("SELECT category_id FROM category WHERE slug = $1")
            .bind(slugify(p.category))
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("category {} missing", p.category))?;
        sqlx::query(
            r#"
            INSERT INTO product
                (partner_code, name, slug, product_type, category_id, sample_type,
                 fasting_required, report_tat_hours, mrp_paise, price_paise, is_popular)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (partner_code) DO NOTHING
            "#,
        )
        .bind(p.partner_code)
        .bind(p.name)
        .bind(slugify(p.name))
        .bind(p.product_type)
        .bind(category_id)
        .bind(p.sample_type)
        .bind(p.fasting)
        .bind(p.tat_hours)
        .bind(p.mrp_paise)
        .bind(p.price_paise)
        .bind(p.popular)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn seed_promos(conn: &mut PgConnection) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO promo_code
            (code, description, discount_type, discount_value, max_discount_paise,
             min_order_paise, per_user_limit)
        VALUES ('WELCOME20', '20% off your first booking', $1, 20, 30000, 49900, 1)
        ON CONFLICT (code) DO NOTHING
        "#,
    )
    .bind(DiscountType::Percentage)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn seed_settings(conn: &mut PgConnection) -> anyhow::Result<()> {
    let d = PlatformSettings::default();
    for (key, value) in [
        (KEY_REFERRER_REWARD, json!(d.referrer_reward_paise)),
        (KEY_REFEREE_REWARD, json!(d.referee_reward_paise)),
        (KEY_MAX_WALLET_USAGE, json!(d.max_wallet_usage_percent)),
    ] {
        sqlx::query(
            r#"
            INSERT INTO system_config (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn seed_admin(conn: &mut PgConnection, args: &Args) -> anyhow::Result<()> {
    let email = args.admin_email.trim().to_ascii_lowercase();
    let existing: Option<Uuid> = sqlx::query_scalar("SELECT user_id FROM app_user WHERE email = $1")
        .bind(&email)
        .fetch_optional(&mut *conn)
        .await?;
    if existing.is_some() {
        tracing::info!(%email, "super admin already present");
        return Ok(());
    }

    let password = args
        .admin_password
        .as_deref()
        .ok_or_else(|| anyhow!("--admin-password (or SEED_ADMIN_PASSWORD) is required to create the admin"))?;
    let password_hash = hash_password(password).map_err(|e| anyhow!(e))?;

    let user_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO app_user (email, display_name, password_hash, roles, referral_code)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING user_id
        "#,
    )
    .bind(&email)
    .bind(&args.admin_name)
    .bind(password_hash)
    .bind(ROLE_SUPER_ADMIN)
    .bind(generate_referral_code())
    .fetch_one(&mut *conn)
    .await?;
    wallet::ensure_wallet(&mut *conn, user_id).await?;
    tracing::info!(%email, %user_id, "super admin created");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;
    db::migrate(&pool).await?;

    let mut tx = pool.begin().await?;
    seed_catalog(&mut tx).await?;
    seed_promos(&mut tx).await?;
    seed_settings(&mut tx).await?;
    seed_admin(&mut tx, &args).await?;
    tx.commit().await?;

    tracing::info!("seed complete");
    Ok(())
}
