//! sigil-cli: command-line host for the Sigil wallet engine.
//!
//! Coin data is read from a JSON file (a list of UTXOs as produced by the
//! operator's chain backend). PSBTs are exchanged as base64 files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, Denomination, Network, OutPoint, Script, ScriptBuf, Txid};
use clap::{Args, Parser, Subcommand};
use sigil_core::script::parse_address;
use sigil_core::{AddressType, Chain, FeeRate, Recipient, Utxo};
use sigil_wallet::psbt::{from_base64, to_base64};
use sigil_wallet::{
    AccountConfig, AccountImport, BuiltTransaction, EngineConfig, PsbtSummary, SetupProgress, UsageOracle,
    WalletEngine, WordCount, XpubExport,
};
use zeroize::Zeroizing;

/// Environment variable read instead of prompting for the wallet password.
const PASSWORD_ENV: &str = "SIGIL_WALLET_PASSWORD";

/// Sigil self-custodial Bitcoin wallet.
#[derive(Parser)]
#[command(name = "sigil-cli")]
#[command(version, about = "Self-custodial Bitcoin wallet with multisig PSBT coordination.")]
struct Cli {
    /// Config file (default: <config dir>/sigil/sigil.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Network override: bitcoin, testnet, signet or regtest.
    #[arg(short, long, global = true)]
    network: Option<String>,

    /// Data directory override.
    #[arg(long, global = true)]
    datadir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet file management.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Account management.
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Issue the next receive (or change) address.
    Address(AddressArgs),
    /// Build a transaction from a UTXO file.
    Send(SendArgs),
    /// Sign, merge, finalize and inspect PSBTs.
    Psbt {
        #[command(subcommand)]
        action: PsbtAction,
    },
    /// Transactions built but not yet broadcast.
    Pending {
        #[command(subcommand)]
        action: PendingAction,
    },
}

#[derive(Subcommand)]
enum WalletAction {
    /// Create a new wallet with a fresh mnemonic.
    Create {
        /// Mnemonic length: 12 or 24.
        #[arg(short, long, default_value_t = 24)]
        words: usize,
    },
    /// Restore a wallet from a mnemonic.
    Restore,
    /// Re-encrypt the wallet under a new password.
    ChangePassword,
    /// Print the wallet mnemonic.
    RevealMnemonic,
}

#[derive(Args)]
struct AccountTemplate {
    /// Display name.
    #[arg(long)]
    name: String,

    /// legacy, segwit or native-segwit.
    #[arg(short = 't', long = "type", default_value = "native-segwit")]
    address_type: String,

    /// Multisig policy, e.g. "2-of-3".
    #[arg(short, long)]
    multisig: Option<String>,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Create an account from the wallet seed.
    Create(AccountTemplate),
    /// Import a single-sig account from a separate mnemonic.
    ImportMnemonic(AccountTemplate),
    /// Import a single-sig account from an extended private key.
    ImportXpriv(AccountTemplate),
    /// Import a watch-only account from xpub export files.
    ImportWatch {
        #[command(flatten)]
        template: AccountTemplate,
        /// One export file for single-sig, all `n` for multisig.
        #[arg(required = true)]
        exports: Vec<PathBuf>,
    },
    /// Add a cosigner's xpub export to a pending multisig setup.
    AddCosigner { account: u32, file: PathBuf },
    /// Write this wallet's xpub export for an account.
    Export {
        account: u32,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Scan for used addresses against a JSON list of addresses seen on chain.
    Discover { account: u32, used: PathBuf },
    Rename { account: u32, name: String },
    List,
}

#[derive(Args)]
struct AddressArgs {
    account: u32,

    /// Issue a change address instead of a receive address.
    #[arg(long)]
    change: bool,
}

#[derive(Args)]
struct SendArgs {
    account: u32,

    /// Recipient address.
    #[arg(long)]
    to: String,

    /// Amount in BTC (e.g. 0.015). Omit with --max.
    #[arg(short, long, required_unless_present = "max")]
    amount: Option<String>,

    /// Sweep every available coin to the recipient.
    #[arg(long)]
    max: bool,

    /// Fee rate in sat/vB.
    #[arg(short, long)]
    fee_rate: u64,

    /// JSON file listing the account's UTXOs.
    #[arg(short, long)]
    utxos: PathBuf,

    /// Spend only these outpoints (txid:vout).
    #[arg(long = "coin")]
    coins: Vec<String>,

    /// Where to write the PSBT (multisig or watch-only accounts).
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum PsbtAction {
    Sign {
        account: u32,
        file: PathBuf,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    Merge {
        account: u32,
        a: PathBuf,
        b: PathBuf,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Finalize and print the raw transaction.
    Finalize {
        account: u32,
        file: PathBuf,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Record that the finalized transaction was broadcast.
    Broadcast { account: u32, file: PathBuf },
    Show { file: PathBuf },
}

#[derive(Subcommand)]
enum PendingAction {
    List,
    /// Write the latest copy of a pending PSBT.
    Show {
        txid: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Drop a pending transaction and release its coins.
    Abandon { txid: String },
}

/// Address-usage evidence read from a file.
struct UsedScripts(HashSet<ScriptBuf>);

impl UsageOracle for UsedScripts {
    fn is_used(&self, script_pubkey: &Script) -> bool {
        self.0.contains(script_pubkey)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();
    tracing::debug!(network = %config.network, wallet = %config.wallet_path().display(), "cli: configuration loaded");

    match cli.command {
        Commands::Wallet { action } => match action {
            WalletAction::Create { words } => wallet_create(config, words),
            WalletAction::Restore => wallet_restore(config),
            WalletAction::ChangePassword => {
                let old = read_password("Current password")?;
                let engine = unlock_with_timeout(config, old.clone()).await?;
                let new = prompt_new_password()?;
                engine
                    .change_password(old.as_bytes(), new.as_bytes())
                    .context("Failed to change password")?;
                println!("Password changed.");
                Ok(())
            }
            WalletAction::RevealMnemonic => {
                let engine = open_unlocked(config).await?;
                let phrase = engine.reveal_mnemonic()?;
                println!("{}", phrase.as_str());
                Ok(())
            }
        },
        Commands::Account { action } => account(config, action).await,
        Commands::Address(args) => {
            let engine = open_unlocked(config).await?;
            let chain = if args.change { Chain::Internal } else { Chain::External };
            let info = engine.get_next_address(args.account, chain)?;
            println!("{}", info.address);
            Ok(())
        }
        Commands::Send(args) => send(config, args).await,
        Commands::Psbt { action } => psbt(config, action).await,
        Commands::Pending { action } => pending(config, action).await,
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let default_file = dirs::config_dir().map(|d| d.join("sigil").join("sigil.toml"));
    let file = cli.config.clone().or(default_file);
    let mut config = EngineConfig::load(file.as_deref()).context("Failed to load configuration")?;
    if let Some(network) = &cli.network {
        config.network = Network::from_str(network).with_context(|| format!("Unknown network: {network}"))?;
    }
    if let Some(dir) = &cli.datadir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn wallet_create(config: EngineConfig, words: usize) -> Result<()> {
    let words = match words {
        12 => WordCount::Twelve,
        24 => WordCount::TwentyFour,
        other => bail!("Unsupported mnemonic length: {other} (use 12 or 24)"),
    };
    let password = new_password()?;
    let network = config.network;
    let (engine, phrase) = WalletEngine::create(config, password.as_bytes(), words).context("Failed to create wallet")?;

    println!("\n=== WALLET CREATED ===");
    println!("Network: {network}");
    println!("\nMNEMONIC (write it down):");
    println!("  {}", phrase.as_str());
    println!("\nWARNING: This phrase will NOT be shown again unless you run `wallet reveal-mnemonic`.");
    println!("\nWallet saved to: {}", engine.config().wallet_path().display());
    Ok(())
}

fn wallet_restore(config: EngineConfig) -> Result<()> {
    let phrase = read_secret("Mnemonic")?;
    let passphrase = read_secret("BIP-39 passphrase (empty for none)")?;
    let password = new_password()?;
    let engine = WalletEngine::restore(config, password.as_bytes(), &phrase, &passphrase)
        .context("Failed to restore wallet")?;

    println!("\n=== WALLET RESTORED ===");
    println!("Network: {}", engine.network());
    println!("Wallet saved to: {}", engine.config().wallet_path().display());
    println!("Recreate accounts, then run `account discover` to find used addresses.");
    Ok(())
}

async fn account(config: EngineConfig, action: AccountAction) -> Result<()> {
    let engine = open_unlocked(config).await?;
    match action {
        AccountAction::Create(template) => {
            let progress = engine.create_account(&account_config(&template)?)?;
            print_progress(&progress)
        }
        AccountAction::ImportMnemonic(template) => {
            let phrase = read_secret("Mnemonic")?;
            let passphrase = read_secret("BIP-39 passphrase (empty for none)")?;
            let progress = engine.import_account(AccountImport::Mnemonic { phrase, passphrase }, &account_config(&template)?)?;
            print_progress(&progress)
        }
        AccountAction::ImportXpriv(template) => {
            let xpriv = read_secret("Extended private key")?;
            let progress = engine.import_account(AccountImport::Xpriv(xpriv), &account_config(&template)?)?;
            print_progress(&progress)
        }
        AccountAction::ImportWatch { template, exports } => {
            let exports = exports.iter().map(|p| read_json::<XpubExport>(p)).collect::<Result<Vec<_>>>()?;
            let progress = engine.import_account(AccountImport::Xpubs(exports), &account_config(&template)?)?;
            print_progress(&progress)
        }
        AccountAction::AddCosigner { account, file } => {
            let export: XpubExport = read_json(&file)?;
            let progress = engine.import_cosigner_xpub(account, &export)?;
            print_progress(&progress)
        }
        AccountAction::Export { account, out } => {
            let export = engine.export_xpub(account)?;
            write_output(out.as_deref(), &serde_json::to_string_pretty(&export)?)
        }
        AccountAction::Discover { account, used } => {
            let network = engine.network();
            let addresses: Vec<String> = read_json(&used)?;
            let scripts = addresses
                .iter()
                .map(|a| parse_address(a, network).map(|addr| addr.script_pubkey()))
                .collect::<Result<HashSet<_>, _>>()
                .context("Invalid address in usage file")?;
            let report = engine.discover_addresses(account, &UsedScripts(scripts))?;
            println!("Receive addresses used: {:?}", report.external_used);
            println!("Change addresses used:  {:?}", report.internal_used);
            Ok(())
        }
        AccountAction::Rename { account, name } => {
            engine.rename_account(account, &name)?;
            Ok(())
        }
        AccountAction::List => {
            for acct in engine.accounts()? {
                let policy = if acct.is_multisig() {
                    format!("{}-of-{}", acct.required_signatures(), acct.cosigners().len())
                } else {
                    "single-sig".to_string()
                };
                let watch = if acct.is_watch_only() { " (watch-only)" } else { "" };
                println!(
                    "{:>3}  {:<20} {:<14} {}{}  policy {}",
                    acct.id,
                    acct.name,
                    acct.address_type.as_str(),
                    policy,
                    watch,
                    acct.policy_id().short()
                );
            }
            Ok(())
        }
    }
}

async fn send(config: EngineConfig, args: SendArgs) -> Result<()> {
    let engine = open_unlocked(config).await?;
    let network = engine.network();

    let address = parse_address(&args.to, network).context("Invalid recipient address")?;
    let amount = match &args.amount {
        Some(s) if !args.max => Amount::from_str_in(s, Denomination::Bitcoin).with_context(|| format!("Invalid amount: {s}"))?,
        _ => Amount::ZERO,
    };
    let utxos: Vec<Utxo> = read_json(&args.utxos)?;
    let coins = match args.coins.is_empty() {
        true => None,
        false => Some(
            args.coins
                .iter()
                .map(|c| OutPoint::from_str(c).with_context(|| format!("Invalid outpoint: {c}")))
                .collect::<Result<Vec<_>>>()?,
        ),
    };

    let draft = engine.build_transaction(&sigil_wallet::TransactionRequest {
        account: args.account,
        recipients: vec![Recipient::new(address, amount)],
        fee_rate: FeeRate::from_sat_per_vb(args.fee_rate)?,
        utxos,
        coins,
        send_max: args.max,
    })?;

    print_summary(&draft.summary);
    if let Some(change) = &draft.change {
        println!("Change to: {}", change.address);
    }
    match draft.built {
        BuiltTransaction::Final(done) => {
            println!("\nRaw transaction:");
            println!("{}", serialize_hex(&done.tx));
            if let Some(out) = &args.out {
                write_output(Some(out), &to_base64(&done.psbt))?;
            }
        }
        BuiltTransaction::Psbt(psbt) => {
            println!("\nPSBT needs signatures; share it with the cosigners.");
            write_output(args.out.as_deref(), &to_base64(&psbt))?;
        }
    }
    Ok(())
}

async fn psbt(config: EngineConfig, action: PsbtAction) -> Result<()> {
    if let PsbtAction::Show { file } = &action {
        let psbt = read_psbt(file)?;
        print_summary(&sigil_wallet::coordinator::summarize(&psbt, config.network)?);
        return Ok(());
    }

    let engine = open_unlocked(config).await?;
    match action {
        PsbtAction::Sign { account, file, out } => {
            let signed = engine.sign_transaction(account, &read_psbt(&file)?)?;
            print_summary(&engine.summarize(&signed)?);
            write_output(out.as_deref(), &to_base64(&signed))
        }
        PsbtAction::Merge { account, a, b, out } => {
            let merged = engine.merge_signatures(account, &read_psbt(&a)?, &read_psbt(&b)?)?;
            print_summary(&engine.summarize(&merged)?);
            write_output(out.as_deref(), &to_base64(&merged))
        }
        PsbtAction::Finalize { account, file, out } => {
            let done = engine.finalize_transaction(account, &read_psbt(&file)?)?;
            println!("TxID: {}", done.txid);
            println!("{}", serialize_hex(&done.tx));
            if let Some(out) = &out {
                write_output(Some(out), &to_base64(&done.psbt))?;
            }
            Ok(())
        }
        PsbtAction::Broadcast { account, file } => {
            let sent = engine.mark_broadcast(account, &read_psbt(&file)?)?;
            println!("Recorded broadcast of {}", sent.unsigned_tx.compute_txid());
            Ok(())
        }
        PsbtAction::Show { .. } => Ok(()),
    }
}

async fn pending(config: EngineConfig, action: PendingAction) -> Result<()> {
    let engine = open_unlocked(config).await?;
    match action {
        PendingAction::List => {
            for record in engine.pending_transactions()? {
                println!(
                    "{}  account {:>3}  {} inputs  {}",
                    record.txid,
                    record.account,
                    record.outpoints.len(),
                    record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Ok(())
        }
        PendingAction::Show { txid, out } => {
            let psbt = engine.pending_psbt(parse_txid(&txid)?)?;
            print_summary(&engine.summarize(&psbt)?);
            write_output(out.as_deref(), &to_base64(&psbt))
        }
        PendingAction::Abandon { txid } => {
            engine.abandon(parse_txid(&txid)?)?;
            println!("Abandoned {txid}; its coins are spendable again.");
            Ok(())
        }
    }
}

/// Open the wallet and unlock it, bounding the KDF by the configured
/// unlock timeout.
async fn open_unlocked(config: EngineConfig) -> Result<Arc<WalletEngine>> {
    let password = read_password("Wallet password")?;
    unlock_with_timeout(config, password).await
}

async fn unlock_with_timeout(config: EngineConfig, password: Zeroizing<String>) -> Result<Arc<WalletEngine>> {
    let path = config.wallet_path();
    let engine = Arc::new(
        WalletEngine::open(config).with_context(|| format!("Failed to open wallet: {}", path.display()))?,
    );
    let limit = engine.config().unlock_timeout();

    let worker = Arc::clone(&engine);
    let task = tokio::task::spawn_blocking(move || worker.unlock(password.as_bytes()));
    match tokio::time::timeout(limit, task).await {
        Ok(joined) => joined
            .context("Unlock task failed")?
            .context("Failed to unlock wallet (check password)")?,
        Err(_) => bail!("Unlock did not finish within {}s", limit.as_secs()),
    }
    Ok(engine)
}

fn account_config(template: &AccountTemplate) -> Result<AccountConfig> {
    let address_type = AddressType::from_str(&template.address_type)?;
    match &template.multisig {
        None => Ok(AccountConfig::single_sig(&template.name, address_type)),
        Some(policy) => {
            let (m, n) = policy
                .split_once("-of-")
                .with_context(|| format!("Policy must look like 2-of-3, got {policy}"))?;
            let m: usize = m.trim().parse().context("Invalid threshold")?;
            let n: usize = n.trim().parse().context("Invalid cosigner count")?;
            Ok(AccountConfig::multisig(&template.name, address_type, m, n))
        }
    }
}

fn print_progress(progress: &SetupProgress) -> Result<()> {
    match progress {
        SetupProgress::Pending { id, have, need, export } => {
            println!("Account {id}: waiting for cosigners ({have} of {need} keys).");
            if let Some(export) = export {
                println!("Share this export with your cosigners:");
                println!("{}", serde_json::to_string_pretty(export)?);
            }
        }
        SetupProgress::Complete(created) => {
            println!("Account {} created: {}", created.account.id, created.account.name);
            println!("First receive address: {}", created.first_address.address);
            for risk in &created.risks {
                println!("WARNING: {risk}");
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &PsbtSummary) {
    println!("\n=== TRANSACTION {} ===", summary.txid);
    println!("Status: {}", summary.status);
    for input in &summary.inputs {
        println!(
            "  in  {}  {} sat  {}/{} signatures{}",
            input.outpoint,
            input.value,
            input.have,
            input.need,
            if input.finalized { "  (final)" } else { "" }
        );
    }
    for output in &summary.outputs {
        println!(
            "  out {}  {} sat",
            output.address.as_deref().unwrap_or("<non-standard>"),
            output.value
        );
    }
    println!("Fee: {} sat", summary.fee);
}

fn parse_txid(s: &str) -> Result<Txid> {
    Txid::from_str(s).with_context(|| format!("Invalid txid: {s}"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn read_psbt(path: &Path) -> Result<Psbt> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    from_base64(text.trim()).with_context(|| format!("Invalid PSBT in {}", path.display()))
}

fn write_output(path: Option<&Path>, contents: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Written to {}", path.display());
        }
        None => println!("{contents}"),
    }
    Ok(())
}

fn read_password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password));
    }
    read_secret(prompt)
}

fn read_secret(prompt: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(format!("{prompt}: "))
        .map(Zeroizing::new)
        .context("Failed to read input")
}

fn new_password() -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password));
    }
    prompt_new_password()
}

fn prompt_new_password() -> Result<Zeroizing<String>> {
    let password = read_secret("Enter wallet password")?;
    let confirm = read_secret("Confirm password")?;
    if *password != *confirm {
        bail!("Passwords do not match");
    }
    Ok(password)
}
