use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/accounts", web::post().to(handlers::register_account))
            .route("/accounts", web::get().to(handlers::get_all_balances))
            .route("/accounts/{account}/balance", web::get().to(handlers::get_balance))
            .route("/accounts/{account}/history", web::get().to(handlers::get_history))
            .route("/transactions/new", web::post().to(handlers::new_transaction))
            .route("/transactions/pending", web::get().to(handlers::get_pending_transactions))
            .route("/transactions/search", web::get().to(handlers::search_transactions))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/blocks/hash/{hash}", web::get().to(handlers::get_block_by_hash))
            .route("/blocks/{index}", web::get().to(handlers::get_block))
            .route("/validate", web::get().to(handlers::validate_chain))
    );
}
