//! CLI tests for the `trader` binary.
//!
//! Spawns the binary against a config in a temp dir and checks exit codes and
//! the ledger it leaves behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;

use rust_decimal_macros::dec;
use trader::exit_codes;
use trader::io::ledger::LedgerStore;

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("trader.toml");
    fs::write(&path, body).expect("write config");
    path
}

fn account_config(data_dir: &Path) -> String {
    format!(
        r#"
[account]
signature = "cli-us"
market = "US"
initial_cash = 1000
symbols = ["X"]

[storage]
data_dir = '{}'
"#,
        data_dir.display()
    )
}

fn trader(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_trader"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("run trader")
}

#[test]
fn concurrent_records_get_consecutive_ids() {
    const WRITERS: usize = 6;

    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    let output = trader(&config, &["register"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || trader(&config, &["record", "buy", "X", "1", "--price", "10"]))
        })
        .collect();
    for handle in handles {
        let output = handle.join().expect("record thread");
        assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    }

    let entries = LedgerStore::new(&data_dir).read_all("cli-us").expect("read");
    let ids: Vec<u64> = entries.iter().map(|entry| entry.sequence_id).collect();
    assert_eq!(ids, (0..=WRITERS as u64).collect::<Vec<_>>());

    let latest = &entries[WRITERS].positions;
    assert_eq!(latest.cash, dec!(1000) - dec!(10) * rust_decimal::Decimal::from(WRITERS));
    assert_eq!(latest.holdings.get("X"), Some(&(WRITERS as i64)));
}

#[test]
fn register_twice_keeps_the_first_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    assert!(trader(&config, &["register"]).status.success());
    let second = trader(&config, &["register"]);
    assert!(second.status.success());
    assert!(String::from_utf8_lossy(&second.stdout).contains("already registered"));

    let entries = LedgerStore::new(&data_dir).read_all("cli-us").expect("read");
    assert_eq!(entries.len(), 1);
}

#[test]
fn record_without_registration_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    let output = trader(&config, &["record", "buy", "X", "1", "--price", "10"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("register it first"));
}

#[test]
fn missing_signature_exits_with_config_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "[account]\nmarket = \"US\"\n");

    let output = trader(&config, &["register"]);
    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn unknown_market_exits_with_config_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    let output = trader(&config, &["register", "--market", "JP"]);
    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
    assert!(!data_dir.exists());
}

#[test]
fn missing_config_file_exits_with_config_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = trader(&temp.path().join("absent.toml"), &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn unwritable_data_dir_exits_with_storage_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, "").expect("write blocker");
    let config = write_config(temp.path(), &account_config(&blocker));

    let output = trader(&config, &["register"]);
    assert_eq!(output.status.code(), Some(exit_codes::STORAGE_UNAVAILABLE));
}

#[test]
fn status_lists_builtin_markets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "[account]\nsignature = \"s\"\n");

    let output = trader(&config, &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("HK"));
    assert!(stdout.contains("US"));
    assert!(stdout.contains("REGULAR"));
}

#[test]
fn positions_prints_latest_snapshot() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    assert!(trader(&config, &["register"]).status.success());
    assert!(
        trader(&config, &["record", "buy", "X", "3", "--price", "2.5"])
            .status
            .success()
    );

    let output = trader(&config, &["positions"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 records, last id 1"));
    assert!(stdout.contains("992.5"));
}

#[test]
fn record_without_price_fills_at_the_last_recorded_price() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    assert!(trader(&config, &["register"]).status.success());
    assert!(
        trader(&config, &["record", "buy", "X", "2", "--price", "10"])
            .status
            .success()
    );

    let output = trader(&config, &["record", "buy", "X", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");

    let entries = LedgerStore::new(&data_dir).read_all("cli-us").expect("read");
    assert_eq!(entries.len(), 3);
    let action = entries[2].action.as_ref().expect("action");
    assert_eq!(action.price, dec!(10));
    assert_eq!(entries[2].positions.cash, dec!(970));
}

#[test]
fn record_without_price_or_history_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let config = write_config(temp.path(), &account_config(&data_dir));

    assert!(trader(&config, &["register"]).status.success());
    let ledger = LedgerStore::new(&data_dir).paths("cli-us").ledger_path;
    let before = fs::read(&ledger).expect("ledger");

    let output = trader(&config, &["record", "buy", "X", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAILED), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stderr).contains("no quote"));
    assert_eq!(fs::read(&ledger).expect("ledger"), before);
}

#[test]
fn account_flag_selects_a_listed_account() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let body = format!(
        "{}\n[[accounts]]\nsignature = \"cli-hk\"\nmarket = \"HK\"\ninitial_cash = 50\n",
        account_config(&data_dir)
    );
    let config = write_config(temp.path(), &body);

    let output = trader(&config, &["register", "--account", "cli-hk"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");

    let store = LedgerStore::new(&data_dir);
    assert_eq!(store.read_all("cli-hk").expect("read").len(), 1);
    assert!(store.read_all("cli-us").expect("read").is_empty());

    let unknown = trader(&config, &["positions", "--account", "nobody"]);
    assert_eq!(unknown.status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn register_covers_every_listed_account() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    let body = format!(
        "{}\n[[accounts]]\nsignature = \"cli-hk\"\nmarket = \"HK\"\n",
        account_config(&data_dir)
    );
    let config = write_config(temp.path(), &body);

    let output = trader(&config, &["register"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    let store = LedgerStore::new(&data_dir);
    assert_eq!(store.read_all("cli-us").expect("read").len(), 1);
    assert_eq!(store.read_all("cli-hk").expect("read").len(), 1);
}
