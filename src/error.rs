//! 错误类型定义
//!
//! 提供统一的错误枚举，区分缓存层、Redis层、MySQL层的失败原因

use thiserror::Error;

/// 统一的Result类型
pub type MrResult<T> = Result<T, MrCacheError>;

/// 缓存库错误
#[derive(Error, Debug)]
pub enum MrCacheError {
    /// 空数据，MySQL中没有对应的行，区别于Redis未命中
    #[error("空数据")]
    NullData,

    /// 校验失败（条件字段不存在、类型不匹配等）
    #[error("校验失败 [{field}]: {message}")]
    Validation {
        /// 出错的字段或参数名
        field: String,
        /// 错误描述
        message: String,
    },

    /// Redis操作失败
    #[error("Redis操作失败: {message}")]
    Redis { message: String },

    /// MySQL操作失败
    #[error("MySQL操作失败: {message}")]
    Mysql { message: String },

    /// MySQL主键冲突，插入路径会触发一次自增恢复重试
    #[error("MySQL主键冲突: {message}")]
    DuplicatePrimary { message: String },

    /// Lua返回值无法绑定到目标结构
    #[error("结果绑定失败: {message}")]
    Bind { message: String },

    /// 预加载锁超时
    #[error("预加载锁超时: key={key}")]
    LockTimeout { key: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    Config { message: String },
}

impl MrCacheError {
    /// 是否为空数据哨兵
    pub fn is_null_data(&self) -> bool {
        matches!(self, MrCacheError::NullData)
    }
}

impl From<redis::RedisError> for MrCacheError {
    fn from(e: redis::RedisError) -> Self {
        MrCacheError::Redis {
            message: e.to_string(),
        }
    }
}

impl From<sqlx::Error> for MrCacheError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => MrCacheError::NullData,
            other => MrCacheError::Mysql {
                message: other.to_string(),
            },
        }
    }
}

/// 便捷错误构造宏
#[macro_export]
macro_rules! cache_error {
    (validation, $field:expr, $msg:expr) => {
        $crate::error::MrCacheError::Validation {
            field: $field.to_string(),
            message: $msg.to_string(),
        }
    };
    (redis, $msg:expr) => {
        $crate::error::MrCacheError::Redis {
            message: $msg.to_string(),
        }
    };
    (mysql, $msg:expr) => {
        $crate::error::MrCacheError::Mysql {
            message: $msg.to_string(),
        }
    };
    (bind, $msg:expr) => {
        $crate::error::MrCacheError::Bind {
            message: $msg.to_string(),
        }
    };
    (config, $msg:expr) => {
        $crate::error::MrCacheError::Config {
            message: $msg.to_string(),
        }
    };
}
