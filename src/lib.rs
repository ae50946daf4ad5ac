//! rat_mrcache - MySQL-Redis读写穿透行缓存库
//!
//! 给定一张关系表和一组查询条件，首次未命中时把行物化到Redis hash里，
//! 之后的读直接走Redis；写先过服务端Lua脚本原子变更缓存，再同步落
//! MySQL，MySQL失败删缓存由下次读取重建。预加载锁保证同一个key同一
//! 时刻只有一个加载者，空结果备忘抵挡缓存穿透。
//!
//! 三种缓存形态：
//! - [`CacheRow`]：一个查询条件对应一行，一个hash
//! - [`CacheRows`]：一个查询条件对应多行，索引hash+每行一个hash
//! - [`CacheColumn`]：一个查询条件对应多行，按列存储，每列一个hash

pub mod cache;
pub mod error;
pub mod keys;
pub mod mysql_adapter;
pub mod redis_driver;
pub mod schema;
pub mod script;
pub mod types;

// 宏展开使用
#[doc(hidden)]
pub use once_cell;

// 重新导出常用类型
pub use cache::{CacheColumn, CacheRow, CacheRows, DataMap, DEFAULT_EXPIRE_SECS};
pub use error::{MrCacheError, MrResult};
pub use mysql_adapter::{MysqlAdapter, MysqlConfig};
pub use redis_driver::pass::{del_pass, get_pass, set_pass, PASS_TTL_SECS};
pub use redis_driver::{RedisConfig, RedisDriver};
pub use schema::{FieldColumn, FieldDef, FieldLayout, TableRecord};
pub use script::INCREMENT_KEY;
pub use types::{CallContext, CondItem, CondLink, CondOp, Conds, FieldType, FieldValue};

use rat_logger::info;

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 库名称
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// 获取库信息
pub fn get_info() -> String {
    format!("{} v{}", NAME, VERSION)
}

/// 初始化库
///
/// 注意：日志系统由调用者自行初始化，本库只负责输出
pub fn init() {
    info!("{} 初始化完成", get_info());
}
