//! dns-fallback-probe: inspect fallback decisions offline.

use clap::{Parser, Subcommand};
use dns_fallback::engine::error_response;
use dns_fallback::{AppConfig, FallbackEngine, GeoClassifier, GeoDatabase, GeoRefresher};
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dns-fallback-probe")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Inspect DNS fallback decisions without a running server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a query name is classified before resolution
    Classify {
        /// JSON config file
        #[arg(short, long)]
        config: PathBuf,

        /// Query name
        name: String,
    },

    /// Look up the country of an address in a GeoIP database
    Lookup {
        /// MaxMind database file
        #[arg(short, long)]
        db: PathBuf,

        /// Addresses to look up
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },

    /// Decide whether an answer with the given addresses would be accepted
    Check {
        /// JSON config file
        #[arg(short, long)]
        config: PathBuf,

        /// MaxMind database file used for the country policy
        #[arg(short, long)]
        db: Option<PathBuf>,

        /// Query name
        name: String,

        /// Answer addresses
        #[arg(required = true)]
        ips: Vec<IpAddr>,
    },

    /// Download the subscribed GeoIP database once into a folder
    Refresh {
        /// Subscription URL
        #[arg(short, long)]
        url: String,

        /// Folder holding geo.mmdb
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Classify { config, name } => classify(&config, &name),
        Commands::Lookup { db, ips } => lookup(&db, &ips),
        Commands::Check {
            config,
            db,
            name,
            ips,
        } => check(&config, db.as_deref(), &name, &ips),
        Commands::Refresh { url, dir } => refresh(&url, &dir).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_engine(
    config: &Path,
    db: Option<&Path>,
) -> Result<FallbackEngine, Box<dyn std::error::Error>> {
    let compiled = AppConfig::load(config)?.compile();
    let classifier = GeoClassifier::new();
    if let Some(path) = db {
        classifier.publish(GeoDatabase::open(path)?);
    }
    Ok(FallbackEngine::new(compiled, Arc::new(classifier)))
}

fn classify(config: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let engine = load_engine(config, None)?;
    println!("{}: {}", name, engine.classify(name));
    Ok(())
}

fn lookup(db: &Path, ips: &[IpAddr]) -> Result<(), Box<dyn std::error::Error>> {
    let database = GeoDatabase::open(db)?;
    for ip in ips {
        println!("{}: {}", ip, database.lookup_country(*ip));
    }
    Ok(())
}

fn check(
    config: &Path,
    db: Option<&Path>,
    name: &str,
    ips: &[IpAddr],
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = load_engine(config, db)?;
    let qname = Name::from_str(name)?;

    let mut request = Message::new();
    request.add_query(Query::query(qname.clone(), RecordType::A));

    let mut answer = error_response(&request, ResponseCode::NoError);
    for ip in ips {
        let rdata = match ip {
            IpAddr::V4(v4) => RData::A(A(*v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
        };
        answer.add_answer(Record::from_rdata(qname.clone(), 60, rdata));
    }

    if !engine.has_fallback() {
        log::warn!("No usable name servers configured, every answer is accepted");
    }
    if engine.config().geo.is_active() && !engine.geo().is_loaded() {
        log::warn!("Country policy is active without a database, every address is unknown");
    }

    println!("Class:   {}", engine.classify(name));
    println!("Verdict: {}", engine.decide(&request, Some(&answer)));
    Ok(())
}

async fn refresh(url: &str, folder: &Path) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(folder)?;
    let classifier = Arc::new(GeoClassifier::new());
    dns_fallback::geoip_manager::load_cached_database(folder, &classifier);

    let refresher = GeoRefresher::new(url, folder, classifier);
    let outcome = refresher.refresh_once().await?;
    println!("{}: {}", refresher.db_path().display(), outcome);
    Ok(())
}
