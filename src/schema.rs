//! 表结构描述
//!
//! 结构信息在构造时一次性展开成[`FieldLayout`]，之后全部按整数索引访问，
//! 运行期不再做任何名称查找以外的动态判断。tag名同时是MySQL列名和
//! Redis hash的field名。

use std::collections::HashMap;

use crate::error::MrResult;
use crate::types::{FieldType, FieldValue};
use crate::cache_error;

/// 字段定义
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// tag名，区分大小写
    pub name: &'static str,
    /// 声明类型
    pub ty: FieldType,
    /// 是否可空（Option字段）
    pub nullable: bool,
}

/// 表字段布局，按声明顺序排列
#[derive(Debug)]
pub struct FieldLayout {
    fields: Vec<FieldDef>,
    index: HashMap<&'static str, usize>,
}

impl FieldLayout {
    /// 从字段定义构建布局
    pub fn new(fields: &[FieldDef]) -> Self {
        let mut index = HashMap::with_capacity(fields.len());
        for (i, f) in fields.iter().enumerate() {
            index.insert(f.name, i);
        }
        Self {
            fields: fields.to_vec(),
            index,
        }
    }

    /// 字段列表
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// 字段数量
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// tag名查索引
    pub fn find(&self, tag: &str) -> Option<usize> {
        self.index.get(tag).copied()
    }

    /// 索引处的字段定义
    pub fn field(&self, idx: usize) -> &FieldDef {
        &self.fields[idx]
    }

    /// 校验值可以赋给索引处的字段
    pub fn check_value(&self, idx: usize, value: &FieldValue) -> MrResult<()> {
        let def = &self.fields[idx];
        if value.is_null() || value.assignable_to(def.ty) {
            Ok(())
        } else {
            Err(cache_error!(
                validation,
                def.name,
                format!(
                    "类型不匹配: 值为{}，字段为{}",
                    value.type_name(),
                    def.ty.type_name()
                )
            ))
        }
    }

    /// 索引处的字段是否为基础类型
    pub fn is_base_type(&self, idx: usize) -> bool {
        self.fields[idx].ty.is_base()
    }
}

/// 单个字段列的类型信息和取值/赋值能力
///
/// `Option<T>`表示可空列，None对应[`FieldValue::Null`]
pub trait FieldColumn: Sized {
    /// 对应的声明类型
    const TYPE: FieldType;

    /// 是否可空
    const NULLABLE: bool = false;

    /// 取出字段值
    fn to_value(&self) -> FieldValue;

    /// 写入字段值
    fn assign(&mut self, value: &FieldValue) -> MrResult<()>;
}

macro_rules! impl_field_column {
    ($rust:ty, $ft:expr, $variant:ident, $back:expr) => {
        impl FieldColumn for $rust {
            const TYPE: FieldType = $ft;

            fn to_value(&self) -> FieldValue {
                FieldValue::$variant((*self).clone().into())
            }

            fn assign(&mut self, value: &FieldValue) -> MrResult<()> {
                match value {
                    FieldValue::Null => Ok(()), // 空值不覆盖
                    v => {
                        let f: fn(&FieldValue) -> Option<$rust> = $back;
                        match f(v) {
                            Some(x) => {
                                *self = x;
                                Ok(())
                            }
                            None => Err(crate::error::MrCacheError::Bind {
                                message: format!(
                                    "无法把{}绑定到{}字段",
                                    v.type_name(),
                                    $ft.type_name()
                                ),
                            }),
                        }
                    }
                }
            }
        }
    };
}

impl_field_column!(bool, FieldType::Bool, Bool, |v| match v {
    FieldValue::Bool(b) => Some(*b),
    FieldValue::Int(i) => Some(*i != 0),
    _ => None,
});
impl_field_column!(i32, FieldType::Int, Int, |v| v
    .as_i64()
    .and_then(|x| i32::try_from(x).ok()));
impl_field_column!(i64, FieldType::Int, Int, |v| v.as_i64());
impl_field_column!(u32, FieldType::UInt, UInt, |v| match v {
    FieldValue::UInt(x) => u32::try_from(*x).ok(),
    FieldValue::Int(x) => u32::try_from(*x).ok(),
    _ => None,
});
impl_field_column!(u64, FieldType::UInt, UInt, |v| match v {
    FieldValue::UInt(x) => Some(*x),
    FieldValue::Int(x) => u64::try_from(*x).ok(),
    _ => None,
});
impl_field_column!(f64, FieldType::Float, Float, |v| match v {
    FieldValue::Float(x) => Some(*x),
    FieldValue::Int(x) => Some(*x as f64),
    FieldValue::UInt(x) => Some(*x as f64),
    _ => None,
});
impl_field_column!(String, FieldType::String, String, |v| match v {
    FieldValue::String(s) => Some(s.clone()),
    _ => None,
});
impl_field_column!(Vec<u8>, FieldType::Bytes, Bytes, |v| match v {
    FieldValue::Bytes(b) => Some(b.clone()),
    FieldValue::String(s) => Some(s.clone().into_bytes()),
    _ => None,
});

impl<T: FieldColumn + Clone + Default> FieldColumn for Option<T> {
    const TYPE: FieldType = T::TYPE;
    const NULLABLE: bool = true;

    fn to_value(&self) -> FieldValue {
        match self {
            Some(v) => v.to_value(),
            None => FieldValue::Null,
        }
    }

    fn assign(&mut self, value: &FieldValue) -> MrResult<()> {
        match value {
            FieldValue::Null => {
                *self = None;
                Ok(())
            }
            v => {
                let mut inner = self.take().unwrap_or_default();
                inner.assign(v)?;
                *self = Some(inner);
                Ok(())
            }
        }
    }
}

/// 数据库行结构，配合[`mr_record!`]宏使用
pub trait TableRecord: Default + Clone + Send + Sync + 'static {
    /// 表字段布局，每个类型只构建一次
    fn layout() -> &'static FieldLayout;

    /// 按布局索引取字段值，可空字段未设置时返回Null
    fn get(&self, idx: usize) -> FieldValue;

    /// 按布局索引写字段值
    fn set(&mut self, idx: usize, value: &FieldValue) -> MrResult<()>;
}

/// 定义数据库行结构并实现[`TableRecord`]
///
/// ```ignore
/// mr_record! {
///     /// 用户表
///     pub struct User {
///         "Id" => pub id: i64,
///         "UID" => pub uid: i64,
///         "Name" => pub name: String,
///         "Age" => pub age: Option<i64>,
///     }
/// }
/// ```
#[macro_export]
macro_rules! mr_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $tag:literal => $fvis:vis $fname:ident : $fty:ty ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, PartialEq)]
        $vis struct $name {
            $( $fvis $fname: $fty, )+
        }

        impl $crate::schema::TableRecord for $name {
            fn layout() -> &'static $crate::schema::FieldLayout {
                static LAYOUT: $crate::once_cell::sync::Lazy<$crate::schema::FieldLayout> =
                    $crate::once_cell::sync::Lazy::new(|| {
                        $crate::schema::FieldLayout::new(&[
                            $(
                                $crate::schema::FieldDef {
                                    name: $tag,
                                    ty: <$fty as $crate::schema::FieldColumn>::TYPE,
                                    nullable: <$fty as $crate::schema::FieldColumn>::NULLABLE,
                                },
                            )+
                        ])
                    });
                &LAYOUT
            }

            fn get(&self, idx: usize) -> $crate::types::FieldValue {
                let mut rest = idx;
                $(
                    if rest == 0 {
                        return $crate::schema::FieldColumn::to_value(&self.$fname);
                    }
                    rest -= 1;
                )+
                let _ = rest;
                $crate::types::FieldValue::Null
            }

            fn set(
                &mut self,
                idx: usize,
                value: &$crate::types::FieldValue,
            ) -> $crate::error::MrResult<()> {
                let mut rest = idx;
                $(
                    if rest == 0 {
                        return $crate::schema::FieldColumn::assign(&mut self.$fname, value);
                    }
                    rest -= 1;
                )+
                let _ = rest;
                Err($crate::cache_error!(
                    validation,
                    "idx",
                    format!("字段索引{}越界", idx)
                ))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr_record;

    mr_record! {
        /// 测试表结构
        pub struct Demo {
            "Id" => pub id: i64,
            "UID" => pub uid: u64,
            "Name" => pub name: String,
            "Age" => pub age: Option<i64>,
            "Score" => pub score: f64,
        }
    }

    #[test]
    fn test_layout() {
        let layout = Demo::layout();
        assert_eq!(layout.len(), 5);
        assert_eq!(layout.find("UID"), Some(1));
        assert_eq!(layout.find("uid"), None);
        assert_eq!(layout.field(2).ty, FieldType::String);
        assert!(layout.is_base_type(0));
        assert!(!layout.is_base_type(4));
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut d = Demo::default();
        d.set(0, &FieldValue::Int(7)).unwrap();
        d.set(3, &FieldValue::Int(20)).unwrap();
        assert_eq!(d.id, 7);
        assert_eq!(d.age, Some(20));
        assert_eq!(d.get(0), FieldValue::Int(7));
        assert_eq!(d.get(3), FieldValue::Int(20));
        // 可空字段未设置返回Null
        let fresh = Demo::default();
        assert!(fresh.get(3).is_null());
    }

    #[test]
    fn test_set_null_clears_option() {
        let mut d = Demo::default();
        d.set(3, &FieldValue::Int(5)).unwrap();
        d.set(3, &FieldValue::Null).unwrap();
        assert_eq!(d.age, None);
    }

    #[test]
    fn test_set_type_mismatch() {
        let mut d = Demo::default();
        assert!(d.set(2, &FieldValue::Int(1)).is_err());
        assert!(d.set(9, &FieldValue::Int(1)).is_err());
    }

    #[test]
    fn test_check_value() {
        let layout = Demo::layout();
        assert!(layout.check_value(1, &FieldValue::Int(3)).is_ok());
        assert!(layout.check_value(1, &FieldValue::Int(-3)).is_err());
        assert!(layout.check_value(2, &FieldValue::String("x".into())).is_ok());
        assert!(layout.check_value(2, &FieldValue::Int(1)).is_err());
        assert!(layout.check_value(2, &FieldValue::Null).is_ok());
    }
}
