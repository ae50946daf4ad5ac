//! 基础类型模块
//!
//! 提供字段值模型、查询条件构造器和调用选项

pub mod call_context;
pub mod condition;
pub mod field_value;

pub use call_context::CallContext;
pub use condition::{CondItem, CondLink, CondOp, Conds};
pub use field_value::{FieldType, FieldValue};
