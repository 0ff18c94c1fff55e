//! テスト用の共通セットアップと外部連携のモック

use super::ledger::LedgerStore;
use super::models::BankConnection;
use crate::features::integrations::{
    BankFeed, ChargeRequest, ChargeResponse, ChargeStatus, FeedError, FeedTransaction,
    PaymentProcessor, ProcessorError,
};
use crate::shared::database::create_in_memory_connection;
use crate::shared::security::CredentialEncryption;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_ENCRYPTION_KEY: &str = "test_encryption_key_32_bytes_long";
pub const TEST_ACCESS_TOKEN: &str = "access-sandbox-user-1";

/// 基準時刻（2024-03-13 水曜日 12:00 UTC）
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 13, 12, 0, 0).unwrap()
}

pub fn setup_database() -> Arc<Mutex<Connection>> {
    Arc::new(Mutex::new(create_in_memory_connection().unwrap()))
}

pub fn setup_ledger() -> (Arc<Mutex<Connection>>, LedgerStore) {
    let db = setup_database();
    let ledger = LedgerStore::new(Arc::clone(&db));
    (db, ledger)
}

/// 口座`acc-{user_id}`を持つ銀行連携を登録する
pub fn seed_connection(ledger: &LedgerStore, user_id: &str) -> BankConnection {
    let sealed = CredentialEncryption::new(TEST_ENCRYPTION_KEY)
        .encrypt_credential(TEST_ACCESS_TOKEN)
        .unwrap();
    let connection = ledger
        .register_connection(user_id, "Sandbox Bank", &sealed, t0())
        .unwrap();
    ledger
        .register_account(connection.id, &format!("acc-{user_id}"), "checking", t0())
        .unwrap();
    connection
}

/// 2024年3月`day`日に計上された出金取引
pub fn feed_tx(external_id: &str, amount_minor: i64, day: u32) -> FeedTransaction {
    feed_tx_for("user-1", external_id, amount_minor, day)
}

pub fn feed_tx_for(user_id: &str, external_id: &str, amount_minor: i64, day: u32) -> FeedTransaction {
    FeedTransaction {
        external_id: external_id.to_string(),
        account_ref: format!("acc-{user_id}"),
        amount_minor,
        posted_date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
        name: "Coffee".to_string(),
        category: Some("Food and Drink".to_string()),
    }
}

/// 応答を順に返す銀行フィード
#[derive(Default)]
pub struct MockBankFeed {
    responses: Mutex<VecDeque<Result<Vec<FeedTransaction>, FeedError>>>,
    calls: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    delay: Mutex<Option<Duration>>,
}

impl MockBankFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<Vec<FeedTransaction>, FeedError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, NaiveDate, NaiveDate)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BankFeed for MockBankFeed {
    async fn list_transactions(
        &self,
        access_token: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<FeedTransaction>, FeedError> {
        self.calls
            .lock()
            .unwrap()
            .push((access_token.to_string(), start_date, end_date));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // 応答が尽きたら空の一覧
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// 応答を順に返す決済代行（未設定なら成功）
#[derive(Default)]
pub struct MockPaymentProcessor {
    responses: Mutex<VecDeque<Result<ChargeResponse, ProcessorError>>>,
    requests: Mutex<Vec<ChargeRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<ChargeResponse, ProcessorError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_decline(&self, code: &str) {
        self.push_response(Err(ProcessorError::Declined {
            code: code.to_string(),
            message: format!("Your card was declined ({code})"),
        }));
    }

    pub fn push_status(&self, status: ChargeStatus, reference: &str) {
        self.push_response(Ok(ChargeResponse {
            status,
            reference: reference.to_string(),
            failure_code: None,
            failure_message: None,
        }));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentProcessor for MockPaymentProcessor {
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeResponse, ProcessorError> {
        let call_number = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(ChargeResponse {
                status: ChargeStatus::Succeeded,
                reference: format!("pi_{call_number}"),
                failure_code: None,
                failure_message: None,
            })
        })
    }
}
