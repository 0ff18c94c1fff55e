use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// ユーザー単位の排他制御
///
/// 同一ユーザーの決済処理を直列化し、キュー投入済みのユーザーを記録して
/// 二重投入を防ぐ。別ユーザーの処理は並行して進む。
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    locks: LockMap,
    queued: Arc<Mutex<HashSet<String>>>,
}

/// ユーザーロックのガード
///
/// 解放時、待機中の処理がなければロック表から取り除く。
#[derive(Debug)]
pub struct UserLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<AsyncMutex<()>>,
    user_id: String,
    locks: LockMap,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // 表と自分以外に参照がなければ待機者はいない
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user_id);
        }
    }
}

/// キュー投入済みの記録を解放時に外すガード
///
/// タスクが異常終了しても記録が残らないようにする。
/// 再投入したジョブに記録を引き継ぐ場合は `keep` を呼ぶ。
#[derive(Debug)]
pub struct QueuedMarkerGuard {
    locks: UserLocks,
    user_id: String,
    armed: bool,
}

impl QueuedMarkerGuard {
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedMarkerGuard {
    fn drop(&mut self) {
        if self.armed {
            self.locks.clear_queued(&self.user_id);
        }
    }
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// ユーザーのロックを取得する（他の処理が終わるまで待機）
    pub async fn lock_user(&self, user_id: &str) -> UserLockGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        UserLockGuard {
            guard: Some(guard),
            lock,
            user_id: user_id.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// ロック表に残っているユーザー数
    pub fn tracked_users(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// キュー投入済みとして記録する
    ///
    /// # 戻り値
    /// 新たに記録できた場合true、既に投入済みならfalse
    pub fn try_mark_queued(&self, user_id: &str) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_string())
    }

    /// キュー投入済みの記録を外す
    pub fn clear_queued(&self, user_id: &str) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);
    }

    /// 解放時に投入済みの記録を外すガードを作る
    pub fn release_queued_on_drop(&self, user_id: &str) -> QueuedMarkerGuard {
        QueuedMarkerGuard {
            locks: self.clone(),
            user_id: user_id.to_string(),
            armed: true,
        }
    }

    pub fn is_queued(&self, user_id: &str) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(user_id)
    }
}
