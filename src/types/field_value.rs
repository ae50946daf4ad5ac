//! 通用字段值类型
//!
//! 缓存层在Redis hash、MySQL列和调用方结构之间搬运的都是这组标量。
//! 空值不会写入Redis（写入空字符串会破坏后续HINCRBY），统一用Null表达。

use crate::error::{MrCacheError, MrResult};
use redis::{RedisWrite, ToRedisArgs};
use serde::{Deserialize, Serialize};

/// 字段的声明类型，和MySQL列类型一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// 布尔
    Bool,
    /// 有符号整数
    Int,
    /// 无符号整数
    UInt,
    /// 浮点数
    Float,
    /// 字符串
    String,
    /// 字节数组
    Bytes,
}

impl FieldType {
    /// 类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::UInt => "uint",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
        }
    }

    /// 是否为基础类型，只有基础类型可以做数据key
    pub fn is_base(&self) -> bool {
        !matches!(self, FieldType::Float)
    }

    /// 是否为整数类型（自增字段要求）
    pub fn is_integer(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::UInt)
    }
}

/// 字段值
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 空值
    Null,
    /// 布尔值
    Bool(bool),
    /// 整数
    Int(i64),
    /// 无符号整数
    UInt(u64),
    /// 浮点数
    Float(f64),
    /// 字符串
    String(String),
    /// 字节数组
    Bytes(Vec<u8>),
    /// 值列表，仅用于IN条件，不对应任何列类型
    List(Vec<FieldValue>),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => write!(f, ""),
            FieldValue::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::UInt(u) => write!(f, "{}", u),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            FieldValue::List(items) => {
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl FieldValue {
    /// 是否为空值
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// 值对应的声明类型，Null和List没有
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Null | FieldValue::List(_) => None,
            FieldValue::Bool(_) => Some(FieldType::Bool),
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::UInt(_) => Some(FieldType::UInt),
            FieldValue::Float(_) => Some(FieldType::Float),
            FieldValue::String(_) => Some(FieldType::String),
            FieldValue::Bytes(_) => Some(FieldType::Bytes),
        }
    }

    /// 值类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::List(_) => "list",
            other => other.field_type().map(|t| t.type_name()).unwrap_or("null"),
        }
    }

    /// 值是否可赋给指定类型的字段
    ///
    /// 有符号/无符号整数之间在取值范围内互相兼容，和MySQL列的行为一致
    pub fn assignable_to(&self, ty: FieldType) -> bool {
        match (self, ty) {
            (FieldValue::Bool(_), FieldType::Bool) => true,
            (FieldValue::Int(_), FieldType::Int) => true,
            (FieldValue::Int(v), FieldType::UInt) => *v >= 0,
            (FieldValue::UInt(_), FieldType::UInt) => true,
            (FieldValue::UInt(v), FieldType::Int) => *v <= i64::MAX as u64,
            (FieldValue::Float(_), FieldType::Float) => true,
            (FieldValue::String(_), FieldType::String) => true,
            (FieldValue::Bytes(_), FieldType::Bytes) => true,
            _ => false,
        }
    }

    /// 取整数值，自增字段使用
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::UInt(v) if *v <= i64::MAX as u64 => Some(*v as i64),
            _ => None,
        }
    }

    /// 按声明类型解析Redis返回的字节串
    pub fn parse(ty: FieldType, raw: &[u8]) -> MrResult<FieldValue> {
        let text = || String::from_utf8_lossy(raw);
        match ty {
            FieldType::Bool => match text().as_ref() {
                "1" | "true" => Ok(FieldValue::Bool(true)),
                "0" | "false" | "" => Ok(FieldValue::Bool(false)),
                other => Err(MrCacheError::Bind {
                    message: format!("无法解析bool值: {}", other),
                }),
            },
            FieldType::Int => text().parse::<i64>().map(FieldValue::Int).map_err(|e| {
                MrCacheError::Bind {
                    message: format!("无法解析int值 {}: {}", text(), e),
                }
            }),
            FieldType::UInt => text().parse::<u64>().map(FieldValue::UInt).map_err(|e| {
                MrCacheError::Bind {
                    message: format!("无法解析uint值 {}: {}", text(), e),
                }
            }),
            FieldType::Float => text().parse::<f64>().map(FieldValue::Float).map_err(|e| {
                MrCacheError::Bind {
                    message: format!("无法解析float值 {}: {}", text(), e),
                }
            }),
            FieldType::String => Ok(FieldValue::String(text().into_owned())),
            FieldType::Bytes => Ok(FieldValue::Bytes(raw.to_vec())),
        }
    }

    /// 格式化为Redis参数字节
    pub fn to_arg_bytes(&self) -> Vec<u8> {
        match self {
            FieldValue::Bytes(b) => b.clone(),
            other => other.to_string().into_bytes(),
        }
    }
}

impl ToRedisArgs for FieldValue {
    fn write_redis_args<W: ?Sized + RedisWrite>(&self, out: &mut W) {
        out.write_arg(&self.to_arg_bytes());
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::UInt(v as u64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        assert_eq!(FieldValue::Int(-3).to_string(), "-3");
        assert_eq!(FieldValue::UInt(7).to_string(), "7");
        assert_eq!(FieldValue::Bool(true).to_string(), "1");
        assert_eq!(FieldValue::Bool(false).to_string(), "0");
        assert_eq!(FieldValue::String("abc".into()).to_string(), "abc");
    }

    #[test]
    fn test_parse_roundtrip() {
        let v = FieldValue::parse(FieldType::Int, b"42").unwrap();
        assert_eq!(v, FieldValue::Int(42));
        let v = FieldValue::parse(FieldType::Float, b"1.5").unwrap();
        assert_eq!(v, FieldValue::Float(1.5));
        let v = FieldValue::parse(FieldType::Bool, b"1").unwrap();
        assert_eq!(v, FieldValue::Bool(true));
        assert!(FieldValue::parse(FieldType::Int, b"xx").is_err());
    }

    #[test]
    fn test_assignable() {
        assert!(FieldValue::Int(1).assignable_to(FieldType::UInt));
        assert!(!FieldValue::Int(-1).assignable_to(FieldType::UInt));
        assert!(FieldValue::UInt(9).assignable_to(FieldType::Int));
        assert!(!FieldValue::String("x".into()).assignable_to(FieldType::Int));
    }
}
