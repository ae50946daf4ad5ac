//! Redis驱动封装
//!
//! 持有共享的异步连接，提供脚本执行和key删除两类入口。
//! 连接断开由`ConnectionManager`自动重连。

pub mod lock;
pub mod pass;

use rat_logger::{debug, error, info};
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use serde::{Deserialize, Serialize};

use crate::error::MrResult;
use crate::types::CallContext;

/// Redis连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// host:port
    pub addr: String,
    /// 密码
    #[serde(default)]
    pub passwd: Option<String>,
    /// 数据库编号
    #[serde(default)]
    pub db: i64,
}

impl RedisConfig {
    /// 连接地址
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            passwd: None,
            db: 0,
        }
    }

    fn url(&self) -> String {
        match &self.passwd {
            Some(passwd) => format!("redis://:{}@{}/{}", passwd, self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }
}

/// Redis驱动，可低成本克隆
#[derive(Clone)]
pub struct RedisDriver {
    conn: ConnectionManager,
}

impl RedisDriver {
    /// 建立连接并PING确认
    pub async fn connect(cfg: &RedisConfig) -> MrResult<Self> {
        let client = redis::Client::open(cfg.url().as_str())?;
        let mut conn = ConnectionManager::new(client).await.map_err(|e| {
            error!("Redis连接失败: addr={} err={}", cfg.addr, e);
            e
        })?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        info!("Redis连接成功: addr={} db={}", cfg.addr, cfg.db);
        Ok(Self { conn })
    }

    /// 执行Lua脚本
    pub(crate) async fn run_script(
        &self,
        ctx: &CallContext,
        name: &str,
        script: &Script,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> MrResult<Value> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_slice());
        }
        let mut conn = self.conn.clone();
        let reply: Value = invocation.invoke_async(&mut conn).await.map_err(|e| {
            error!("脚本{}执行失败: keys={:?} err={}{}", name, keys, e, ctx.log_tag());
            e
        })?;
        if !ctx.no_log {
            debug!("脚本{}执行完成: key={}", name, keys.first().map(String::as_str).unwrap_or(""));
        }
        Ok(reply)
    }

    /// 删除key，补偿路径使用
    pub(crate) async fn del_keys(&self, ctx: &CallContext, keys: &[String]) -> MrResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key.as_str());
        }
        let mut conn = self.conn.clone();
        cmd.query_async::<_, i64>(&mut conn).await.map_err(|e| {
            error!("删除缓存key失败: keys={:?} err={}{}", keys, e, ctx.log_tag());
            e
        })?;
        if !ctx.no_log {
            debug!("已删除缓存key: {:?}", keys);
        }
        Ok(())
    }

    /// key是否存在
    pub(crate) async fn exists(&self, key: &str) -> MrResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    /// SET NX PX，抢锁用
    pub(crate) async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> MrResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// HSET，自增恢复路径回写最大值用
    pub(crate) async fn hset(&self, key: &str, field: &str, value: i64) -> MrResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}
