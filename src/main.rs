// =============================================================================
// CLI entry point (§6). No `clap` — the teacher's `main.rs` parses its own
// env vars and a couple of flags by hand, and this follows the same style:
// two subcommands, `run_bots` and `run_backtest`, with documented exit codes
// (0 = normal SIGINT shutdown, 1 = initialization failure, 2 = fatal
// uncaught error).
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use quantdesk_core::backtest::{BacktestConfig, BacktestDataSource, BacktestEngine};
use quantdesk_core::cache::Cache;
use quantdesk_core::exchange::Candle;
use quantdesk_core::llm::LlmProvider;
use quantdesk_core::repo::{
    ExchangeRow, InMemoryBotRepo, InMemoryExchangeRepo, InMemoryLlmConfigRepo,
    InMemorySystemConfigRepo, InMemoryTradeHistoryRepo, LlmConfigRow,
};
use quantdesk_core::scheduler::{CycleScheduler, SchedulerDeps};
use quantdesk_core::state::{BotConfig, QuantSignalWeights, RiskLimits, TradingMode};
use quantdesk_core::telemetry;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    telemetry::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let exit_code = match args.first().map(String::as_str) {
        Some("run_bots") => run_bots(&args[1..]).await,
        Some("run_backtest") => run_backtest(&args[1..]).await,
        _ => {
            eprintln!(
                "usage:\n  run_bots --bot-ids <id> [<id> ...]\n  run_backtest --bot-id <id> --start <rfc3339> --end <rfc3339> [--max-cycles <n>]"
            );
            1
        }
    };
    std::process::exit(exit_code);
}

/// `run_bots --bot-ids i j k ...` (§6, §4.13). Builds the shared
/// `SchedulerDeps` from env vars (no database is wired up; see
/// `SPEC_FULL.md` §A) and hands off to `CycleScheduler::run_many`, which
/// blocks until SIGINT.
async fn run_bots(args: &[String]) -> i32 {
    let bot_ids = match parse_ids_flag(args, "--bot-ids") {
        Some(ids) if !ids.is_empty() => ids,
        _ => {
            eprintln!("run_bots requires --bot-ids <id> [<id> ...]");
            return 1;
        }
    };

    let deps = match build_scheduler_deps(&bot_ids) {
        Ok(deps) => deps,
        Err(e) => {
            error!(error = %e, "failed to initialize scheduler dependencies");
            return 1;
        }
    };

    let scheduler = Arc::new(CycleScheduler::new(deps));
    match scheduler.run_many(&bot_ids).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "run_bots exited with an error");
            2
        }
    }
}

/// Builds the process-local bot/exchange/llm universe. Defaults are read
/// from env vars, matching the teacher's `AURORA_SYMBOLS`-style overrides;
/// `BOT_IDS`-scoped config is intentionally flat since persistence is out
/// of scope (§1 Non-goals) and a single operator-managed bot fleet is the
/// expected deployment shape.
fn build_scheduler_deps(bot_ids: &[i64]) -> anyhow::Result<SchedulerDeps> {
    let exchange_id = 1_i64;
    let llm_id = 1_i64;

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let exchange_repo = Arc::new(InMemoryExchangeRepo::new(vec![ExchangeRow {
        id: exchange_id,
        name: "binance_futures".to_string(),
        api_key,
        api_secret,
        testnet: env_bool("EXCHANGE_TESTNET", false),
    }]));

    let llm_provider = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai_compatible".to_string());
    let llm_config_repo = Arc::new(InMemoryLlmConfigRepo::new(
        vec![LlmConfigRow {
            id: llm_id,
            provider: llm_provider,
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
            base_url: std::env::var("LLM_BASE_URL").ok(),
        }],
        Some(llm_id),
    ));

    let symbols = env_csv("BOT_TIMEFRAMES", &["3m", "4h"]);

    let bot_configs: Vec<BotConfig> = bot_ids
        .iter()
        .copied()
        .map(|id| BotConfig {
            id,
            name: format!("bot-{id}"),
            exchange_id,
            workflow_id: 1,
            llm_id,
            trading_mode: env_trading_mode(),
            cycle_interval_seconds: env_u64("CYCLE_INTERVAL_SECONDS", 300),
            risk_limits: RiskLimits::default(),
            quant_signal_weights: QuantSignalWeights::default(),
            quant_signal_threshold: env_i32("QUANT_SIGNAL_THRESHOLD", 20),
            tracing_enabled: true,
            initial_balance: env_f64("INITIAL_BALANCE_USD", 10_000.0),
            timeframes: symbols.clone(),
        })
        .collect();

    Ok(SchedulerDeps {
        bot_repo: Arc::new(InMemoryBotRepo::new(bot_configs)),
        exchange_repo,
        llm_config_repo,
        system_config_repo: Arc::new(InMemorySystemConfigRepo::new()),
        trade_history_repo: Arc::new(InMemoryTradeHistoryRepo::new()),
        cache: Arc::new(Cache::new()),
        status_dir: std::env::var("STATUS_DIR").ok().map(PathBuf::from),
    })
}

/// `run_backtest --bot-id i --start ... --end ... [--max-cycles n]` (§6,
/// §4.15). Historical OHLCV loading is out of scope for this binary (no
/// data vendor is wired up); candles are read from a local fixture
/// directory (`BACKTEST_FIXTURE_DIR`, one `<symbol>_<timeframe>.json` file
/// per series, each a JSON array of `Candle`) when set, otherwise the
/// engine runs with an empty `BacktestDataSource` and every cycle drops its
/// symbols for lack of cached OHLCV (still useful as a dry run of the
/// wiring).
async fn run_backtest(args: &[String]) -> i32 {
    let bot_id = match parse_id_flag(args, "--bot-id") {
        Some(id) => id,
        None => {
            eprintln!("run_backtest requires --bot-id <id>");
            return 1;
        }
    };
    let start = match parse_datetime_flag(args, "--start") {
        Some(t) => t,
        None => {
            eprintln!("run_backtest requires --start <rfc3339>");
            return 1;
        }
    };
    let end = match parse_datetime_flag(args, "--end") {
        Some(t) => t,
        None => {
            eprintln!("run_backtest requires --end <rfc3339>");
            return 1;
        }
    };
    let max_cycles = parse_id_flag(args, "--max-cycles").map(|n| n as u64);

    let symbols = env_csv("BACKTEST_SYMBOLS", &["BTCUSDT", "ETHUSDT"]);
    let timeframes = env_csv("BOT_TIMEFRAMES", &["3m", "4h"]);

    let data = match std::env::var("BACKTEST_FIXTURE_DIR") {
        Ok(dir) => match load_fixture_data(&PathBuf::from(dir), &symbols, &timeframes) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "failed to load backtest fixtures");
                return 1;
            }
        },
        Err(_) => BacktestDataSource::default(),
    };

    let config = BacktestConfig {
        bot_id,
        start,
        end,
        symbols,
        timeframes,
        initial_balance: env_f64("INITIAL_BALANCE_USD", 10_000.0),
        cycle_interval_seconds: env_u64("CYCLE_INTERVAL_SECONDS", 300),
        slippage_pct: env_f64("BACKTEST_SLIPPAGE_PCT", 0.02),
        risk_limits: RiskLimits::default(),
        quant_signal_weights: QuantSignalWeights::default(),
        quant_signal_threshold: env_i32("QUANT_SIGNAL_THRESHOLD", 20),
        max_cycles,
    };

    let llm_provider = LlmProvider::OpenAiCompatible {
        base_url: std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
        model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
    };

    let mut engine = match BacktestEngine::new(config, data, llm_provider) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to initialize backtest engine");
            return 1;
        }
    };

    match engine.run().await {
        Ok(report) => {
            info!(
                cycles_run = report.cycles_run,
                final_balance = report.final_balance,
                total_trades = report.total_trades,
                win_rate_pct = report.performance.win_rate_pct,
                sharpe = report.performance.sharpe,
                max_drawdown = report.performance.max_drawdown,
                "backtest complete"
            );
            println!("cycles_run:     {}", report.cycles_run);
            println!("final_balance:  {:.2}", report.final_balance);
            println!("total_trades:   {}", report.total_trades);
            println!("win_rate_pct:   {:.2}", report.performance.win_rate_pct);
            println!("total_return:   {:.2}", report.performance.total_return_usd);
            println!("sharpe:         {:.3}", report.performance.sharpe);
            println!("max_drawdown:   {:.4}", report.performance.max_drawdown);
            println!("profit_factor:  {:.3}", report.performance.profit_factor);
            0
        }
        Err(e) => {
            error!(error = %e, "run_backtest exited with an error");
            2
        }
    }
}

fn load_fixture_data(
    dir: &PathBuf,
    symbols: &[String],
    timeframes: &[String],
) -> anyhow::Result<BacktestDataSource> {
    let mut data = BacktestDataSource::default();
    for symbol in symbols {
        for timeframe in timeframes {
            let path = dir.join(format!("{symbol}_{timeframe}.json"));
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let candles: Vec<Candle> = serde_json::from_str(&raw)?;
            data.insert_candles(symbol, timeframe, candles);
        }
    }
    Ok(data)
}

fn env_trading_mode() -> TradingMode {
    match std::env::var("TRADING_MODE").unwrap_or_default().to_lowercase().as_str() {
        "live" => TradingMode::Live,
        _ => TradingMode::Paper,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn parse_id_flag(args: &[String], flag: &str) -> Option<i64> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).and_then(|v| v.parse().ok())
}

fn parse_ids_flag(args: &[String], flag: &str) -> Option<Vec<i64>> {
    let idx = args.iter().position(|a| a == flag)?;
    let ids: Vec<i64> = args[idx + 1..]
        .iter()
        .take_while(|a| !a.starts_with("--"))
        .filter_map(|a| a.parse().ok())
        .collect();
    Some(ids)
}

fn parse_datetime_flag(args: &[String], flag: &str) -> Option<DateTime<Utc>> {
    let idx = args.iter().position(|a| a == flag)?;
    let raw = args.get(idx + 1)?;
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}
