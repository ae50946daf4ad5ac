//! 空结果备忘
//!
//! 查询MySQL确认不存在的key记到进程内的并发map里，4秒内的重复未命中
//! 直接短路，不再回源，防止缓存穿透。窗口期内别处插入的数据要等备忘
//! 过期才可见，这是已知取舍。

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::time::{SystemTime, UNIX_EPOCH};

/// 备忘有效期（秒）
pub const PASS_TTL_SECS: i64 = 4;

static PASS_CACHE: Lazy<DashMap<String, i64>> = Lazy::new(DashMap::new);

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn get_pass_at(key: &str, now: i64) -> bool {
    match PASS_CACHE.get(key) {
        Some(at) => {
            if now - *at >= PASS_TTL_SECS {
                drop(at);
                PASS_CACHE.remove(key);
                false
            } else {
                true
            }
        }
        None => false,
    }
}

/// key是否在备忘有效期内
pub fn get_pass(key: &str) -> bool {
    get_pass_at(key, now_secs())
}

/// 记录空结果
pub fn set_pass(key: &str) {
    PASS_CACHE.insert(key.to_string(), now_secs());
}

/// 清除备忘，插入或删除成功后调用
pub fn del_pass(key: &str) {
    PASS_CACHE.remove(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_window() {
        let key = "mrr_test_pass_window";
        set_pass(key);
        let at = *PASS_CACHE.get(key).unwrap();
        assert!(get_pass_at(key, at));
        assert!(get_pass_at(key, at + PASS_TTL_SECS - 1));
        // 到期后判定失效并被清掉
        assert!(!get_pass_at(key, at + PASS_TTL_SECS));
        assert!(!PASS_CACHE.contains_key(key));
    }

    #[test]
    fn test_del_pass() {
        let key = "mrr_test_del_pass";
        set_pass(key);
        assert!(get_pass(key));
        del_pass(key);
        assert!(!get_pass(key));
    }

    #[test]
    fn test_unknown_key() {
        assert!(!get_pass("mrr_never_set"));
    }
}
