//! A command-line interface for the provenance ledger.

use anyhow::{bail, Context};
use clap::Parser;
use provenance_chain::transaction::checked_fee;
use provenance_chain::wallet::normalize_address;
use provenance_chain::{CallRequest, Config, DeployRequest, Node, TransactionKind, Wallet};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file, layered under PROVENANCE_* environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage the local wallet
    #[command(subcommand)]
    Wallet(WalletCommand),
    /// Get the confirmed balance of an address (defaults to the local wallet)
    Balance {
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Send coins and mine them into a block
    Send {
        #[arg(short, long)]
        to: String,
        #[arg(short, long)]
        amount: u64,
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        fee: i64,
    },
    /// Register a product batch and mine it into a block
    Batch {
        #[arg(long)]
        id: String,
        #[arg(long)]
        product: String,
        #[arg(long)]
        quantity: u64,
        #[arg(short, long)]
        to: String,
        #[arg(short, long, default_value_t = 1)]
        amount: u64,
    },
    /// Anchor a document hash and mine it into a block
    Document {
        #[arg(long)]
        hash: String,
        #[arg(long)]
        title: String,
        #[arg(short, long)]
        to: String,
        #[arg(short, long, default_value_t = 1)]
        amount: u64,
    },
    /// Mine a block with whatever is pending, rewarding the local wallet
    Mine,
    /// Inspect the chain
    #[command(subcommand)]
    Chain(ChainCommand),
    /// Look up a transaction by hash
    Tx { hash: String },
    /// Transactions sent or received by an address
    History { address: String },
    /// Deploy and invoke contracts
    #[command(subcommand)]
    Contract(ContractCommand),
}

#[derive(clap::Subcommand, Debug)]
enum WalletCommand {
    /// Create a new wallet at the configured path
    New {
        #[arg(long)]
        force: bool,
    },
    /// Show the wallet address and public key
    Show,
    /// Import a hex private key into the configured path
    Import {
        #[arg(long)]
        key: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ChainCommand {
    /// Print a block by index or hash (latest when omitted)
    Show { block: Option<String> },
    /// Recompute hashes, links, proofs and signatures
    Validate,
    /// Chain statistics
    Stats,
}

#[derive(clap::Subcommand, Debug)]
enum ContractCommand {
    /// Deploy a JSON op-code program
    Deploy {
        /// JSON array of operations
        #[arg(long)]
        code: String,
        /// JSON object used as the initial state
        #[arg(long, default_value = "{}")]
        state: String,
    },
    /// Run the stored code, or ad hoc operations
    Call {
        address: String,
        #[arg(long)]
        ops: Option<String>,
        #[arg(long)]
        gas: Option<u64>,
    },
    /// Print a contract's state
    State { address: String },
    /// List deployed contracts
    List,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_wallet(config: &Config) -> anyhow::Result<Wallet> {
    Wallet::load(&config.wallet_path).with_context(|| {
        format!(
            "no wallet at {} (run `cli wallet new`)",
            config.wallet_path.display()
        )
    })
}

fn submit_and_mine(
    node: &Node,
    wallet: &Wallet,
    kind: TransactionKind,
    to: &str,
    amount: u64,
    fee: u64,
) -> anyhow::Result<()> {
    let tx = wallet.create_transaction_with_kind(kind, to, amount, fee)?;
    let hash = node.chain.add_transaction(tx)?;
    let block = node.chain.mine_block(wallet.address())?;
    print_json(&serde_json::json!({
        "tx": hash,
        "block": block.index,
        "blockHash": block.hash,
    }))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Wallet(command) => run_wallet(command, &config),
        command => run(command, &config),
    }
}

fn run_wallet(command: WalletCommand, config: &Config) -> anyhow::Result<()> {
    match command {
        WalletCommand::New { force } => {
            if config.wallet_path.exists() && !force {
                bail!(
                    "wallet already exists at {} (use --force to replace it)",
                    config.wallet_path.display()
                );
            }
            let wallet = Wallet::generate_at(&config.wallet_path)?;
            println!("{}", wallet.address());
            Ok(())
        }
        WalletCommand::Show => {
            let wallet = load_wallet(config)?;
            print_json(&serde_json::json!({
                "address": wallet.address(),
                "publicKey": wallet.public_key(),
            }))
        }
        WalletCommand::Import { key } => {
            let wallet = Wallet::import(&key)?;
            wallet.save(&config.wallet_path)?;
            println!("{}", wallet.address());
            Ok(())
        }
    }
}

fn run(command: Commands, config: &Config) -> anyhow::Result<()> {
    let node = Node::open_sled(config)?;

    match command {
        Commands::Wallet(command) => return run_wallet(command, config),
        Commands::Balance { address } => {
            let address = match address {
                Some(address) => normalize_address(&address),
                None => load_wallet(config)?.address().to_string(),
            };
            println!("{}", node.chain.balance(&address));
        }
        Commands::Send { to, amount, fee } => {
            let wallet = load_wallet(config)?;
            let fee = checked_fee(fee)?;
            submit_and_mine(&node, &wallet, TransactionKind::Transfer, &to, amount, fee)?;
        }
        Commands::Batch {
            id,
            product,
            quantity,
            to,
            amount,
        } => {
            let wallet = load_wallet(config)?;
            let kind = TransactionKind::BatchCreate {
                batch_id: id,
                product,
                quantity,
            };
            submit_and_mine(&node, &wallet, kind, &to, amount, 0)?;
        }
        Commands::Document {
            hash,
            title,
            to,
            amount,
        } => {
            let wallet = load_wallet(config)?;
            let kind = TransactionKind::DocumentUpload {
                document_hash: hash,
                title,
            };
            submit_and_mine(&node, &wallet, kind, &to, amount, 0)?;
        }
        Commands::Mine => {
            let wallet = load_wallet(config)?;
            let block = node.chain.mine_block(wallet.address())?;
            print_json(&block)?;
        }
        Commands::Chain(ChainCommand::Show { block }) => {
            let found = match block {
                None => Some(node.chain.latest_block()),
                Some(id) => match id.parse::<u64>() {
                    Ok(index) => node.chain.block_by_index(index),
                    Err(_) => node.chain.block_by_hash(&id),
                },
            };
            match found {
                Some(block) => print_json(&block)?,
                None => bail!("block not found"),
            }
        }
        Commands::Chain(ChainCommand::Validate) => {
            let report = node.chain.validate_chain_report();
            match report.fault {
                None => println!("valid ({} blocks)", report.blocks_checked),
                Some(fault) => bail!("chain invalid: {fault:?}"),
            }
        }
        Commands::Chain(ChainCommand::Stats) => print_json(&node.chain.stats())?,
        Commands::Tx { hash } => match node.chain.transaction(&hash) {
            Some(record) => print_json(&record)?,
            None => bail!("transaction {hash} not found"),
        },
        Commands::History { address } => {
            print_json(&node.chain.transactions_by_address(&normalize_address(&address)))?
        }
        Commands::Contract(ContractCommand::Deploy { code, state }) => {
            let request = DeployRequest {
                code: serde_json::from_str(&code).context("--code must be JSON")?,
                initial_state: serde_json::from_str(&state).context("--state must be a JSON object")?,
            };
            print_json(&node.contracts.deploy(request)?)?;
        }
        Commands::Contract(ContractCommand::Call { address, ops, gas }) => {
            let ops = match ops {
                Some(ops) => Some(serde_json::from_str(&ops).context("--ops must be a JSON array")?),
                None => None,
            };
            let response = node.contracts.call(CallRequest {
                address,
                ops,
                gas_limit: gas,
            })?;
            print_json(&response)?;
        }
        Commands::Contract(ContractCommand::State { address }) => {
            match node.contracts.get_state(&address)? {
                Some(state) => print_json(&state)?,
                None => bail!("contract {address} not found"),
            }
        }
        Commands::Contract(ContractCommand::List) => {
            for address in node.contracts.addresses()? {
                println!("{address}");
            }
        }
    }
    Ok(())
}
