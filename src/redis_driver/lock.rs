//! 预加载锁
//!
//! 每个缓存key一把锁，保证"查MySQL+写Redis"同一时刻只有一个加载者。
//! 进程内先用本地锁去重，跨进程以Redis锁为准（SET NX PX + token比对删除）。
//!
//! 两种用法：
//! - [`PreloadLocks::lock`]：独占锁，需要创建数据的路径使用，抢不到就等到超时
//! - [`PreloadLocks::try_lock_wait`]：纯读路径使用，抢不到时等别人释放后返回None，
//!   调用方重读Redis即可，不重复回源

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rat_logger::warn;
use redis::Script;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout, Instant};

use crate::error::{MrCacheError, MrResult};
use crate::redis_driver::RedisDriver;

/// 锁超时时间
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(8);

/// 抢锁失败后的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// token比对删除，避免释放别人的锁
static UNLOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// 进程内的锁表
#[derive(Default)]
pub struct PreloadLocks {
    local: DashMap<String, Arc<Mutex<()>>>,
}

/// 持有的预加载锁，release后Redis锁和本地锁一起释放
pub struct PreloadGuard {
    redis: RedisDriver,
    lock_key: String,
    token: String,
    released: bool,
    _local: OwnedMutexGuard<()>,
}

impl PreloadGuard {
    /// 释放锁
    pub async fn release(mut self) {
        self.released = true;
        let mut conn = self.redis.connection();
        if let Err(e) = UNLOCK
            .prepare_invoke()
            .key(self.lock_key.as_str())
            .arg(self.token.as_str())
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            warn!("释放预加载锁失败: key={} err={}", self.lock_key, e);
        }
    }
}

impl Drop for PreloadGuard {
    fn drop(&mut self) {
        if !self.released {
            // 调用方提前退出时兜底释放，锁本身也有PX过期
            let redis = self.redis.clone();
            let lock_key = std::mem::take(&mut self.lock_key);
            let token = std::mem::take(&mut self.token);
            tokio::spawn(async move {
                let mut conn = redis.connection();
                let _ = UNLOCK
                    .prepare_invoke()
                    .key(lock_key.as_str())
                    .arg(token.as_str())
                    .invoke_async::<_, i64>(&mut conn)
                    .await;
            });
        }
    }
}

impl PreloadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn local_entry(&self, key: &str) -> Arc<Mutex<()>> {
        self.local
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cleanup_local(&self, key: &str) {
        // map里一份 + 调用方一份，没有其他等待者就回收
        self.local.remove_if(key, |_, v| Arc::strong_count(v) <= 2);
    }

    /// 独占锁，抢不到一直等，到8秒超时报错
    pub async fn lock(&self, redis: &RedisDriver, lock_key: &str) -> MrResult<PreloadGuard> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let entry = self.local_entry(lock_key);
        let local = timeout(LOCK_TIMEOUT, entry.lock_owned())
            .await
            .map_err(|_| MrCacheError::LockTimeout {
                key: lock_key.to_string(),
            })?;

        let token = new_token();
        loop {
            if redis
                .set_nx_px(lock_key, &token, LOCK_TIMEOUT.as_millis() as u64)
                .await?
            {
                return Ok(PreloadGuard {
                    redis: redis.clone(),
                    lock_key: lock_key.to_string(),
                    token,
                    released: false,
                    _local: local,
                });
            }
            if Instant::now() >= deadline {
                drop(local);
                self.cleanup_local(lock_key);
                return Err(MrCacheError::LockTimeout {
                    key: lock_key.to_string(),
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// 尝试抢锁；抢不到时等持有者释放后返回None，由调用方重读缓存
    pub async fn try_lock_wait(
        &self,
        redis: &RedisDriver,
        lock_key: &str,
    ) -> MrResult<Option<PreloadGuard>> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let entry = self.local_entry(lock_key);
        let local = match entry.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                // 进程内已有加载者，等它释放
                let guard = timeout(LOCK_TIMEOUT, entry.lock_owned())
                    .await
                    .map_err(|_| MrCacheError::LockTimeout {
                        key: lock_key.to_string(),
                    })?;
                drop(guard);
                self.cleanup_local(lock_key);
                return Ok(None);
            }
        };

        let token = new_token();
        if redis
            .set_nx_px(lock_key, &token, LOCK_TIMEOUT.as_millis() as u64)
            .await?
        {
            return Ok(Some(PreloadGuard {
                redis: redis.clone(),
                lock_key: lock_key.to_string(),
                token,
                released: false,
                _local: local,
            }));
        }

        // 其他进程在加载，轮询到锁消失
        loop {
            sleep(POLL_INTERVAL).await;
            if !redis.exists(lock_key).await? {
                drop(local);
                self.cleanup_local(lock_key);
                return Ok(None);
            }
            if Instant::now() >= deadline {
                drop(local);
                self.cleanup_local(lock_key);
                return Err(MrCacheError::LockTimeout {
                    key: lock_key.to_string(),
                });
            }
        }
    }

    /// 释放guard并回收本地锁表项
    pub async fn release(&self, guard: PreloadGuard) {
        let key = guard.lock_key.clone();
        guard.release().await;
        self.cleanup_local(&key);
    }
}
