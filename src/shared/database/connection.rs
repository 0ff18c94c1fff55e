use crate::shared::errors::AppResult;
use rusqlite::Connection;
use std::path::Path;

/// データベース接続を初期化し、テーブルを作成する
///
/// # 引数
/// * `database_path` - SQLiteデータベースファイルのパス
///
/// # 戻り値
/// データベース接続、または失敗時はエラー
///
/// # 処理内容
/// 1. データベース接続の開設
/// 2. PRAGMAの設定
/// 3. テーブル作成とマイグレーションの実行
pub fn initialize_database(database_path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(database_path)?;

    configure_connection(&conn)?;
    create_tables(&conn)?;

    log::info!("データベースを初期化しました: {:?}", database_path);

    Ok(conn)
}

/// テスト・検証用のインメモリデータベースを作成する
pub fn create_in_memory_connection() -> AppResult<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_connection(&conn)?;
    create_tables(&conn)?;
    Ok(conn)
}

/// 接続ごとのPRAGMAを設定する
fn configure_connection(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;

    // インメモリDBではWALにならないため結果は確認しない
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    Ok(())
}

/// データベーステーブルを作成する
///
/// # 引数
/// * `conn` - データベース接続
///
/// # 戻り値
/// 成功時はOk(())、失敗時はエラー
pub fn create_tables(conn: &Connection) -> AppResult<()> {
    create_bank_tables(conn)?;
    create_round_up_entries_table(conn)?;
    create_round_up_settings_table(conn)?;
    create_settlement_tables(conn)?;
    create_payment_profiles_table(conn)?;

    migrate_existing_tables(conn)?;
    create_indexes(conn)?;

    Ok(())
}

/// 銀行連携・口座・取引テーブルを作成する
fn create_bank_tables(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            institution TEXT NOT NULL,
            encrypted_access_token TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_synced_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES bank_connections(id),
            user_id TEXT NOT NULL,
            account_ref TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            account_id INTEGER NOT NULL REFERENCES bank_accounts(id),
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            posted_date TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// ラウンドアップエントリテーブルを作成する
fn create_round_up_entries_table(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS round_up_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            source_transaction_id INTEGER NOT NULL UNIQUE REFERENCES bank_transactions(id),
            round_up_amount INTEGER NOT NULL CHECK(round_up_amount > 0),
            detected_amount INTEGER NOT NULL,
            status TEXT NOT NULL CHECK(status IN (
                'PENDING', 'INVESTED', 'FAILED', 'INSUFFICIENT_FUNDS', 'CARD_DECLINED', 'RETRY_PENDING'
            )),
            settlement_id INTEGER REFERENCES settlement_records(id),
            invested_amount INTEGER,
            failure_reason TEXT,
            decline_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// ラウンドアップ設定テーブルを作成する
fn create_round_up_settings_table(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS round_up_settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            frequency TEXT NOT NULL,
            period_limit INTEGER CHECK(period_limit IS NULL OR period_limit >= 0),
            destination TEXT,
            last_run_at TEXT,
            next_run_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// 決済記録・決済明細テーブルを作成する
fn create_settlement_tables(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settlement_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL CHECK(amount > 0),
            status TEXT NOT NULL CHECK(status IN ('SUCCESS', 'PENDING', 'FAILED')),
            processor_reference TEXT,
            failure_reason TEXT,
            customer_ref TEXT NOT NULL,
            instrument_ref TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            job_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settlement_items (
            settlement_id INTEGER NOT NULL REFERENCES settlement_records(id),
            entry_id INTEGER NOT NULL REFERENCES round_up_entries(id),
            allowed_amount INTEGER NOT NULL CHECK(allowed_amount > 0),
            PRIMARY KEY (settlement_id, entry_id)
        )",
        [],
    )?;

    Ok(())
}

/// 決済プロファイルテーブルを作成する
fn create_payment_profiles_table(conn: &Connection) -> AppResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL UNIQUE,
            customer_ref TEXT NOT NULL,
            default_instrument_ref TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// 既存テーブルのマイグレーションを実行する
fn migrate_existing_tables(conn: &Connection) -> AppResult<()> {
    // decline_countのない旧スキーマ向け
    if !check_column_exists(conn, "round_up_entries", "decline_count") {
        log::info!("decline_countカラムを追加します...");
        conn.execute(
            "ALTER TABLE round_up_entries ADD COLUMN decline_count INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    Ok(())
}

/// インデックスを作成する
fn create_indexes(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_bank_connections_user ON bank_connections(user_id);
         CREATE INDEX IF NOT EXISTS idx_bank_transactions_account ON bank_transactions(account_id);
         CREATE INDEX IF NOT EXISTS idx_round_up_entries_user_status ON round_up_entries(user_id, status);
         CREATE INDEX IF NOT EXISTS idx_round_up_entries_settlement ON round_up_entries(settlement_id);
         CREATE INDEX IF NOT EXISTS idx_round_up_settings_enabled ON round_up_settings(enabled);
         CREATE INDEX IF NOT EXISTS idx_settlement_records_user_created ON settlement_records(user_id, created_at);
         CREATE INDEX IF NOT EXISTS idx_settlement_records_status ON settlement_records(status);
         CREATE INDEX IF NOT EXISTS idx_settlement_records_reference ON settlement_records(processor_reference);",
    )?;

    Ok(())
}

/// テーブルに指定されたカラムが存在するかチェックする
///
/// # 引数
/// * `conn` - データベース接続
/// * `table_name` - テーブル名
/// * `column_name` - カラム名
///
/// # 戻り値
/// カラムが存在する場合はtrue、存在しないかエラーの場合はfalse
fn check_column_exists(conn: &Connection, table_name: &str, column_name: &str) -> bool {
    let query = format!("PRAGMA table_info({table_name})");

    let Ok(mut stmt) = conn.prepare(&query) else {
        return false;
    };

    let exists = match stmt.query_map([], |row| row.get::<_, String>(1)) {
        Ok(rows) => rows.flatten().any(|name| name == column_name),
        Err(_) => false,
    };
    exists
}
