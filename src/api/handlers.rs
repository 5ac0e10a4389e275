use actix_web::{http::StatusCode, web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::blockchain::account::AccountError;
use crate::blockchain::transaction::TransactionError;
use crate::blockchain::{
    Account, Address, Balance, Block, Blockchain, BlockchainError, History, MineOutcome, MinedBlock, Transaction,
    TransactionFilter,
};

/// Data structure for the ledger state
pub type BlockchainData = web::Data<Blockchain>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub is_valid: bool,

    /// First violation found, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request for the register endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    /// The new account's identifier
    pub account: String,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's account
    pub sender: String,

    /// The recipient's account
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The queued transaction
    pub transaction: Transaction,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineRequest {
    /// The account credited with the mining reward
    pub miner: String,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block, absent when there was nothing to mine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mined: Option<MinedBlock>,
}

/// Query for the transaction search endpoint
#[derive(Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchQuery {
    /// Sender or recipient
    pub account: Option<String>,

    /// Smallest amount to include
    pub min_amount: Option<f64>,

    /// Largest amount to include
    pub max_amount: Option<f64>,
}

/// Maps a ledger error to a JSON error response
fn error_response(err: &BlockchainError) -> HttpResponse {
    let status = match err {
        BlockchainError::TransactionError(_) => StatusCode::BAD_REQUEST,
        BlockchainError::AccountError(AccountError::AccountExists(_)) => StatusCode::CONFLICT,
        BlockchainError::AccountError(_) => StatusCode::BAD_REQUEST,
        BlockchainError::MiningConflict(_) => StatusCode::CONFLICT,
        BlockchainError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        BlockchainError::StorageError(_) | BlockchainError::CorruptChain(_) | BlockchainError::SystemError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    HttpResponse::build(status).json(serde_json::json!({
        "error": err.to_string(),
        "reason": reason(err),
    }))
}

/// Short machine-readable rejection reason
fn reason(err: &BlockchainError) -> &'static str {
    match err {
        BlockchainError::TransactionError(TransactionError::InvalidAmount(_)) => "InvalidAmount",
        BlockchainError::TransactionError(TransactionError::UnknownRecipient(_)) => "UnknownRecipient",
        BlockchainError::TransactionError(TransactionError::UnknownSender(_)) => "UnknownSender",
        BlockchainError::TransactionError(TransactionError::InsufficientFunds { .. }) => "InsufficientFunds",
        BlockchainError::AccountError(AccountError::AccountExists(_)) => "AccountExists",
        BlockchainError::AccountError(AccountError::UnknownAccount(_)) => "UnknownAccount",
        BlockchainError::AccountError(_) => "InvalidAccount",
        BlockchainError::MiningConflict(_) => "MiningConflict",
        BlockchainError::Cancelled => "Cancelled",
        BlockchainError::StorageError(_) => "StorageError",
        BlockchainError::CorruptChain(_) => "CorruptChain",
        BlockchainError::SystemError(_) => "SystemError",
    }
}

fn not_found(message: String) -> HttpResponse {
    HttpResponse::NotFound().json(serde_json::json!({ "error": message }))
}

/// Register an account
///
/// Creates an account funded with the configured opening balance
#[utoipa::path(
    post,
    path = "/api/v1/accounts",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = Account),
        (status = 400, description = "Invalid identifier"),
        (status = 409, description = "Account already exists")
    )
)]
pub async fn register_account(blockchain: BlockchainData, request: web::Json<RegisterRequest>) -> impl Responder {
    match blockchain.open_account(Address(request.account.trim().to_string())) {
        Ok(account) => HttpResponse::Created().json(account),
        Err(err) => error_response(&err),
    }
}

/// Get all balances
///
/// Returns confirmed and available balances of every account
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Balances retrieved successfully", body = Vec<Balance>)
    )
)]
pub async fn get_all_balances(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.list_balances())
}

/// Get an account's balance
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{account}/balance",
    params(("account" = String, Path, description = "Account identifier")),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = Balance)
    )
)]
pub async fn get_balance(blockchain: BlockchainData, account: web::Path<String>) -> impl Responder {
    let address = Address(account.into_inner());
    HttpResponse::Ok().json(blockchain.get_balance(&address))
}

/// Get an account's transaction history
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{account}/history",
    params(("account" = String, Path, description = "Account identifier")),
    responses(
        (status = 200, description = "History retrieved successfully", body = History)
    )
)]
pub async fn get_history(blockchain: BlockchainData, account: web::Path<String>) -> impl Responder {
    let address = Address(account.into_inner());
    HttpResponse::Ok().json(blockchain.list_history(&address))
}

/// Create a new transaction
///
/// Queues a transfer as pending
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = TransactionResponse),
        (status = 400, description = "Transaction rejected")
    )
)]
pub async fn new_transaction(
    blockchain: BlockchainData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let request = transaction_req.into_inner();

    match blockchain.submit_transfer(Address(request.sender), Address(request.recipient), request.amount) {
        Ok(transaction) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction added to pending list".to_string(),
            transaction,
        }),
        Err(err) => error_response(&err),
    }
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(blockchain: BlockchainData) -> impl Responder {
    HttpResponse::Ok().json(blockchain.list_pending())
}

/// Search transactions
///
/// Filters every transaction by account and amount range
#[utoipa::path(
    get,
    path = "/api/v1/transactions/search",
    params(SearchQuery),
    responses(
        (status = 200, description = "Matching transactions", body = Vec<Transaction>)
    )
)]
pub async fn search_transactions(blockchain: BlockchainData, query: web::Query<SearchQuery>) -> impl Responder {
    let query = query.into_inner();
    let filter = TransactionFilter {
        account: query.account.map(Address),
        min_amount: query.min_amount,
        max_amount: query.max_amount,
    };

    HttpResponse::Ok().json(blockchain.search_transactions(&filter))
}

/// Mine a new block
///
/// Seals every eligible pending transaction into a block
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined, or nothing to mine", body = MineResponse),
        (status = 400, description = "Invalid miner"),
        (status = 409, description = "Chain advanced while mining, retry"),
        (status = 503, description = "Mining cancelled")
    )
)]
pub async fn mine_block(blockchain: BlockchainData, mine_req: web::Json<MineRequest>) -> impl Responder {
    let miner = Address(mine_req.into_inner().miner);
    let ledger = blockchain.into_inner();

    // the nonce search is CPU bound, keep it off the async workers
    let outcome = match web::block(move || ledger.mine(miner)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("Mining task failed: {}", err)
            }));
        }
    };

    match outcome {
        Ok(MineOutcome::Mined(mined)) => HttpResponse::Ok().json(MineResponse {
            message: format!(
                "Block {} mined, nonce {}",
                mined.block.index, mined.nonce
            ),
            mined: Some(mined),
        }),
        Ok(MineOutcome::NoEligibleTransactions) => HttpResponse::Ok().json(MineResponse {
            message: "No eligible transactions to mine".to_string(),
            mined: None,
        }),
        Err(err) => error_response(&err),
    }
}

/// Get the full blockchain
///
/// Returns the entire chain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(blockchain: BlockchainData) -> impl Responder {
    let chain = blockchain.list_chain();
    let is_valid = blockchain.is_valid();

    HttpResponse::Ok().json(ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    })
}

/// Get a block by index
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{index}",
    params(("index" = u64, Path, description = "Block index")),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block at this index")
    )
)]
pub async fn get_block(blockchain: BlockchainData, index: web::Path<u64>) -> impl Responder {
    let index = index.into_inner();
    match blockchain.search_by_block_index(index) {
        Some(block) => HttpResponse::Ok().json(block),
        None => not_found(format!("Block {} not found", index)),
    }
}

/// Get a block by hash
#[utoipa::path(
    get,
    path = "/api/v1/blocks/hash/{hash}",
    params(("hash" = String, Path, description = "Hex encoded block hash")),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block with this hash")
    )
)]
pub async fn get_block_by_hash(blockchain: BlockchainData, hash: web::Path<String>) -> impl Responder {
    let hash = hash.into_inner();
    match blockchain.search_by_block_hash(&hash) {
        Some(block) => HttpResponse::Ok().json(block),
        None => not_found(format!("Block with hash {} not found", hash)),
    }
}

/// Check if the blockchain is valid
///
/// Validates the entire chain
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    let response = match blockchain.validate() {
        Ok(()) => ValidationResponse {
            is_valid: true,
            error: None,
        },
        Err(err) => ValidationResponse {
            is_valid: false,
            error: Some(err.to_string()),
        },
    };

    HttpResponse::Ok().json(response)
}
