use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;

mod api;
mod blockchain;
mod config;

use config::Config;

// Open the ledger, from storage unless configured to run in memory
fn initialize_ledger(config: &Config) -> anyhow::Result<blockchain::Blockchain> {
    if config.storage.in_memory {
        warn!("Running with an in-memory ledger, nothing will be persisted");
        return Ok(blockchain::Blockchain::new(&config.ledger));
    }

    let data_dir = &config.storage.path;
    std::fs::create_dir_all(data_dir).with_context(|| format!("Failed to create data directory {}", data_dir))?;

    let storage = blockchain::SledStore::open(data_dir)
        .with_context(|| format!("Failed to open storage at {}", data_dir))?;
    let ledger = blockchain::Blockchain::with_storage(&config.ledger, Arc::new(storage))
        .context("Failed to load ledger from storage")?;

    info!("Loaded ledger from storage at {}", data_dir);
    Ok(ledger)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::register_account,
        api::handlers::get_all_balances,
        api::handlers::get_balance,
        api::handlers::get_history,
        api::handlers::new_transaction,
        api::handlers::get_pending_transactions,
        api::handlers::search_transactions,
        api::handlers::mine_block,
        api::handlers::get_chain,
        api::handlers::get_block,
        api::handlers::get_block_by_hash,
        api::handlers::validate_chain
    ),
    components(
        schemas(
            blockchain::Account,
            blockchain::Address,
            blockchain::Balance,
            blockchain::Block,
            blockchain::History,
            blockchain::MinedBlock,
            blockchain::Transaction,
            blockchain::transaction::TransactionStatus,
            api::handlers::ChainResponse,
            api::handlers::ValidationResponse,
            api::handlers::RegisterRequest,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger simulator API endpoints")
    ),
    info(
        title = "Ledger Simulator API",
        version = "0.1.0",
        description = "A single-node proof-of-work ledger simulator",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::load().context("Failed to load configuration")?;

    let ledger = web::Data::new(initialize_ledger(&config)?);
    info!(
        "Ledger ready: {} blocks, difficulty {}, mining reward {}",
        ledger.list_chain().len(),
        ledger.difficulty(),
        ledger.mining_reward()
    );
    let shutdown_ledger = ledger.clone();

    let bind = (config.server.host.clone(), config.server.port);
    info!("Starting HTTP server at http://{}:{}", bind.0, bind.1);

    let server = HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .disable_signals()
    .bind(bind)?
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, cancelling any mining round");
            shutdown_ledger.cancel_mining();
            handle.stop(true).await;
        }
    });

    server.await?;
    info!("Server stopped");
    Ok(())
}
