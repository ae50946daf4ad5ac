//! 缓存引擎
//!
//! 三种形态共用一个核心：[`TablePlan`]承载表结构相关的纯逻辑（条件校验、
//! 参数组装、key规划），[`CacheCore`]在其上挂Redis/MySQL句柄和预加载锁。
//! 读写的编排（先Redis后MySQL、失败删缓存重建）在各形态文件里。

pub mod column;
pub mod row;
pub mod rows;

use std::collections::HashMap;

use rat_logger::error;
use redis::Value;

use crate::cache_error;
use crate::error::{MrCacheError, MrResult};
use crate::keys;
use crate::keys::CacheShape;
use crate::mysql_adapter::{build_insert, MysqlAdapter};
use crate::redis_driver::lock::PreloadLocks;
use crate::redis_driver::RedisDriver;
use crate::schema::{FieldLayout, TableRecord};
use crate::script::{INCR, INCREMENT_KEY};
use crate::types::{CallContext, CondOp, Conds, FieldType, FieldValue};

pub use column::CacheColumn;
pub use row::CacheRow;
pub use rows::CacheRows;

/// 默认过期时间36小时
pub const DEFAULT_EXPIRE_SECS: i64 = 36 * 3600;

/// 数据map，tag名到新值；Null表示置空
pub type DataMap = HashMap<String, FieldValue>;

/// Lua脚本参数组装
pub(crate) struct ScriptArgs {
    inner: Vec<Vec<u8>>,
}

impl ScriptArgs {
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn push_i64(&mut self, v: i64) {
        self.inner.push(v.to_string().into_bytes());
    }

    pub fn push_usize(&mut self, v: usize) {
        self.inner.push(v.to_string().into_bytes());
    }

    pub fn push_str(&mut self, s: &str) {
        self.inner.push(s.as_bytes().to_vec());
    }

    pub fn push_value(&mut self, v: &FieldValue) {
        self.inner.push(v.to_arg_bytes());
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn as_slice(&self) -> &[Vec<u8>] {
        &self.inner
    }
}

/// 修改操作的单字段描述，按布局顺序排列
#[derive(Debug, Clone)]
pub(crate) struct FieldOp {
    /// 布局索引
    pub idx: usize,
    /// set/del/incr/fincr/get
    pub op: &'static str,
    /// 参数值，get/del时为空串占位
    pub value: FieldValue,
}

/// 表结构相关的纯逻辑：校验、key规划、脚本参数组装
pub(crate) struct TablePlan {
    pub table: String,
    pub layout: &'static FieldLayout,
    pub expire: i64,
    pub hash_tag_field: Option<String>,
    pub increment_field: Option<usize>,
    pub increment_table: String,
    pub shard_count: u32,
    pub shard_index: u32,
    pub one_cond_field: Option<String>,
    pub query_cond: Conds,
}

impl TablePlan {
    pub fn new(table: &str, layout: &'static FieldLayout) -> Self {
        // 默认第一个字段为自增字段，不是整数类型就不启用自增
        let increment_field = layout
            .fields()
            .first()
            .filter(|def| def.ty.is_integer())
            .map(|_| 0);
        Self {
            table: table.to_string(),
            layout,
            expire: DEFAULT_EXPIRE_SECS,
            hash_tag_field: None,
            increment_field,
            increment_table: table.to_string(),
            shard_count: 0,
            shard_index: 0,
            one_cond_field: None,
            query_cond: Conds::new(),
        }
    }

    // 配置 /////////////////////////////////////////////////////////////////

    fn must_find(&self, field: &str) -> MrResult<usize> {
        self.layout.find(field).ok_or_else(|| {
            cache_error!(
                validation,
                field,
                format!("tag不存在于{}的结构中", self.table)
            )
        })
    }

    pub fn config_hash_tag(&mut self, field: &str) -> MrResult<()> {
        self.must_find(field)?;
        self.hash_tag_field = Some(field.to_string());
        Ok(())
    }

    pub fn config_increment(&mut self, field: &str, increment_table: &str) -> MrResult<()> {
        let idx = self.must_find(field)?;
        if !self.layout.field(idx).ty.is_integer() {
            return Err(cache_error!(validation, field, "自增字段必须是整数类型"));
        }
        self.increment_field = Some(idx);
        self.increment_table = if increment_table.is_empty() {
            self.table.clone()
        } else {
            increment_table.to_string()
        };
        Ok(())
    }

    pub fn config_expire(&mut self, expire_secs: i64) -> MrResult<()> {
        if expire_secs <= 0 {
            return Err(cache_error!(config, "过期时间必须大于0"));
        }
        self.expire = expire_secs;
        Ok(())
    }

    pub fn config_shard(&mut self, shard_count: u32, shard_index: u32) -> MrResult<()> {
        if shard_count > 0 && shard_index >= shard_count {
            return Err(cache_error!(config, "分片序号必须小于分片总数"));
        }
        self.shard_count = shard_count;
        self.shard_index = shard_index;
        Ok(())
    }

    pub fn config_query_cond(&mut self, cond: Conds) -> MrResult<()> {
        for item in cond.items() {
            self.must_find(&item.field)?;
        }
        self.query_cond = cond;
        Ok(())
    }

    pub fn config_one_cond_field(&mut self, field: &str) -> MrResult<()> {
        self.must_find(field)?;
        self.one_cond_field = Some(field.to_string());
        Ok(())
    }

    // 校验与key ////////////////////////////////////////////////////////////

    /// 校验条件集合：字段存在、类型匹配；eq_only要求全部为等值条件
    pub fn check_cond(&self, cond: &Conds, eq_only: bool) -> MrResult<()> {
        if cond.is_empty() {
            return Err(cache_error!(validation, "cond", "条件不能为空"));
        }
        for item in cond.items() {
            if eq_only && item.op != CondOp::Eq {
                return Err(cache_error!(validation, item.field, "只支持等值条件"));
            }
            let idx = self.must_find(&item.field)?;
            match &item.value {
                FieldValue::Null => {
                    return Err(cache_error!(validation, item.field, "条件值不能为空"));
                }
                FieldValue::List(list) => {
                    if item.op != CondOp::In {
                        return Err(cache_error!(validation, item.field, "列表值只能用于IN"));
                    }
                    for v in list {
                        self.layout.check_value(idx, v)?;
                    }
                }
                v => self.layout.check_value(idx, v)?,
            }
        }
        Ok(())
    }

    /// 校验条件并生成缓存key
    pub fn plan_key(&self, shape: CacheShape, cond: &Conds, eq_only: bool) -> MrResult<String> {
        self.check_cond(cond, eq_only)?;
        Ok(keys::build_key(
            shape,
            &self.table,
            cond,
            self.hash_tag_field.as_deref(),
        ))
    }

    /// 校验条件并生成column形态的key列表
    pub fn plan_column_keys(&self, cond: &Conds) -> MrResult<Vec<String>> {
        self.check_cond(cond, true)?;
        Ok(keys::build_column_keys(
            &self.table,
            self.layout,
            cond,
            self.hash_tag_field.as_deref(),
        ))
    }

    /// 校验数据map并转成按布局排序的(索引,值)对
    pub fn check_data(&self, data: &DataMap) -> MrResult<Vec<(usize, FieldValue)>> {
        if data.is_empty() {
            return Err(cache_error!(validation, "data", "数据不能为空"));
        }
        let mut pairs = Vec::with_capacity(data.len());
        for (tag, value) in data {
            let idx = self.must_find(tag)?;
            if !value.is_null() {
                self.layout.check_value(idx, value)?;
            }
            pairs.push((idx, value.clone()));
        }
        pairs.sort_by_key(|(idx, _)| *idx);
        Ok(pairs)
    }

    /// 单条件便捷形式展开
    pub fn one_cond<V: Into<FieldValue>>(&self, value: V) -> MrResult<Conds> {
        match &self.one_cond_field {
            Some(field) => Ok(Conds::new().eq(field, value)),
            None => Err(cache_error!(config, "需要先配置one_cond_field")),
        }
    }

    /// 按布局组装INSERT参数：自增字段用incr_value，其余依次取等值条件、数据map、零值
    pub fn insert_args(
        &self,
        cond: &Conds,
        data_pairs: &[(usize, FieldValue)],
        incr_value: i64,
    ) -> Vec<FieldValue> {
        let mut args = Vec::with_capacity(self.layout.len());
        for (i, def) in self.layout.fields().iter().enumerate() {
            if self.increment_field == Some(i) {
                args.push(FieldValue::Int(incr_value));
                continue;
            }
            if let Some(item) = cond.find(def.name) {
                if item.op == CondOp::Eq {
                    args.push(item.value.clone());
                    continue;
                }
            }
            if let Some((_, v)) = data_pairs.iter().find(|(idx, _)| *idx == i) {
                args.push(v.clone());
                continue;
            }
            // 缺省列：可空写NULL，非空写类型零值
            if def.nullable {
                args.push(FieldValue::Null);
            } else {
                args.push(zero_value(def.ty));
            }
        }
        args
    }

    // 脚本参数组装 /////////////////////////////////////////////////////////

    /// get类脚本参数：过期时间 + 全部字段名
    pub fn tag_args(&self) -> ScriptArgs {
        let mut args = ScriptArgs::new();
        args.push_i64(self.expire);
        for def in self.layout.fields() {
            args.push_str(def.name);
        }
        args
    }

    /// set类脚本字段表：跳过自增字段、条件字段和exclude；Null翻译成del
    pub fn set_ops(
        &self,
        cond: &Conds,
        data_pairs: &[(usize, FieldValue)],
        exclude: &[usize],
    ) -> Vec<FieldOp> {
        let mut ops = Vec::with_capacity(data_pairs.len());
        for (idx, value) in data_pairs {
            if self.increment_field == Some(*idx)
                || exclude.contains(idx)
                || cond.find(self.layout.field(*idx).name).is_some()
            {
                continue;
            }
            if value.is_null() {
                ops.push(FieldOp {
                    idx: *idx,
                    op: "del",
                    value: FieldValue::String(String::new()),
                });
            } else {
                ops.push(FieldOp {
                    idx: *idx,
                    op: "set",
                    value: value.clone(),
                });
            }
        }
        ops
    }

    /// modify类脚本字段表：自增/条件/exclude字段只读回；整数incr、浮点fincr、
    /// 其他set；Null读回当前值
    pub fn modify_ops(
        &self,
        cond: &Conds,
        data_pairs: &[(usize, FieldValue)],
        exclude: &[usize],
    ) -> Vec<FieldOp> {
        let mut ops = Vec::with_capacity(data_pairs.len());
        for (idx, value) in data_pairs {
            let read_only = self.increment_field == Some(*idx)
                || exclude.contains(idx)
                || cond.find(self.layout.field(*idx).name).is_some()
                || value.is_null();
            if read_only {
                ops.push(FieldOp {
                    idx: *idx,
                    op: "get",
                    value: FieldValue::String(String::new()),
                });
                continue;
            }
            let op = match self.layout.field(*idx).ty {
                FieldType::Int | FieldType::UInt => "incr",
                FieldType::Float => "fincr",
                _ => "set",
            };
            ops.push(FieldOp {
                idx: *idx,
                op,
                value: value.clone(),
            });
        }
        ops
    }

    /// 把字段表展开为脚本三元组参数
    pub fn ops_args(&self, ops: &[FieldOp]) -> ScriptArgs {
        let mut args = ScriptArgs::new();
        args.push_i64(self.expire);
        for op in ops {
            args.push_str(self.layout.field(op.idx).name);
            args.push_str(op.op);
            args.push_value(&op.value);
        }
        args
    }

    /// 把一行记录展开为(索引,值)对，空值不写入
    pub fn record_kv_pairs<T: TableRecord>(&self, record: &T) -> Vec<(usize, FieldValue)> {
        let mut pairs = Vec::with_capacity(self.layout.len());
        for idx in 0..self.layout.len() {
            let value = record.get(idx);
            if !value.is_null() {
                pairs.push((idx, value));
            }
        }
        pairs
    }

    /// 从HMGET返回的数组绑定记录字段，nil跳过
    pub fn bind_reply_values<T: TableRecord>(
        &self,
        items: &[Value],
        field_idxs: &[usize],
        dest: &mut T,
    ) -> MrResult<()> {
        if items.len() != field_idxs.len() {
            return Err(cache_error!(
                bind,
                format!(
                    "返回值数量{}和字段数量{}不一致",
                    items.len(),
                    field_idxs.len()
                )
            ));
        }
        for (item, idx) in items.iter().zip(field_idxs) {
            let value = reply_to_value(item, self.layout.field(*idx).ty)?;
            if let Some(v) = value {
                dest.set(*idx, &v)?;
            }
        }
        Ok(())
    }
}

/// 三种形态共用的核心：纯逻辑 + 外部句柄
pub(crate) struct CacheCore {
    pub redis: RedisDriver,
    pub mysql: MysqlAdapter,
    pub plan: TablePlan,
    pub locks: PreloadLocks,
}

impl CacheCore {
    pub fn new<T: TableRecord>(redis: RedisDriver, mysql: MysqlAdapter, table: &str) -> Self {
        Self {
            redis,
            mysql,
            plan: TablePlan::new(table, T::layout()),
            locks: PreloadLocks::new(),
        }
    }

    /// 通过Redis分配自增id
    pub async fn alloc_increment(&self, ctx: &CallContext) -> MrResult<i64> {
        let mut args = ScriptArgs::new();
        args.push_str(&self.plan.increment_table);
        args.push_i64(self.plan.shard_count as i64);
        args.push_i64(self.plan.shard_index as i64);
        let reply = self
            .redis
            .run_script(
                ctx,
                "incr",
                &INCR,
                &[INCREMENT_KEY.to_string()],
                args.as_slice(),
            )
            .await?;
        match reply {
            Value::Int(v) => Ok(v),
            other => Err(cache_error!(bind, format!("自增返回值异常: {:?}", other))),
        }
    }

    /// 插入一条数据，返回自增值
    ///
    /// 主键冲突时查一次MAX(自增字段)，用max+1000重试一次，并把max+1回写到
    /// 自增hash。步长留出的空洞是为了躲开并发插入，不要改小。
    pub async fn add_to_mysql(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_pairs: &[(usize, FieldValue)],
    ) -> MrResult<i64> {
        let mut incr_value = 0i64;
        if let Some(idx) = self.plan.increment_field {
            // 数据里带了非零自增值就优先用
            if let Some((_, v)) = data_pairs.iter().find(|(i, _)| *i == idx) {
                incr_value = v.as_i64().unwrap_or(0);
            }
            if incr_value == 0 && !self.plan.increment_table.is_empty() {
                incr_value = self.alloc_increment(ctx).await?;
            }
        }

        let sql = build_insert(&self.plan.table, self.plan.layout);
        let args = self.plan.insert_args(cond, data_pairs, incr_value);
        match self.mysql.exec_insert(&sql, &args).await {
            Ok(()) => Ok(incr_value),
            Err(MrCacheError::DuplicatePrimary { message }) => {
                let Some(idx) = self.plan.increment_field else {
                    return Err(MrCacheError::DuplicatePrimary { message });
                };
                let field = self.plan.layout.field(idx).name;
                let max = self.mysql.select_max(&self.plan.table, field).await?;
                incr_value = max + 1000;
                let args = self.plan.insert_args(cond, data_pairs, incr_value);
                self.mysql.exec_insert(&sql, &args).await?;
                // 保存下最大值，后续分配从这里继续
                let _ = self
                    .redis
                    .hset(INCREMENT_KEY, &self.plan.increment_table, max + 1)
                    .await;
                Ok(incr_value)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_from_mysql<T: TableRecord>(&self, cond: &Conds) -> MrResult<T> {
        self.mysql
            .select_one(&self.plan.table, cond, &self.plan.query_cond)
            .await
    }

    pub async fn gets_from_mysql<T: TableRecord>(&self, cond: &Conds) -> MrResult<Vec<T>> {
        self.mysql
            .select_many(&self.plan.table, cond, &self.plan.query_cond)
            .await
    }

    /// 同步修改到MySQL，自增字段和条件字段不进SET子句
    pub async fn save_to_mysql(
        &self,
        cond: &Conds,
        touched: &[(usize, FieldValue)],
    ) -> MrResult<()> {
        let set_pairs: Vec<(usize, FieldValue)> = touched
            .iter()
            .filter(|(idx, _)| {
                self.plan.increment_field != Some(*idx)
                    && cond.find(self.plan.layout.field(*idx).name).is_none()
            })
            .cloned()
            .collect();
        self.mysql
            .update(&self.plan.table, self.plan.layout, &set_pairs, cond)
            .await
    }

    /// 补偿：MySQL失败后删掉缓存key，下次读取重建
    pub async fn compensate(&self, ctx: &CallContext, keys: &[String]) {
        if let Err(e) = self.redis.del_keys(ctx, keys).await {
            error!(
                "补偿删除缓存失败: table={} keys={:?} err={}{}",
                self.plan.table,
                keys,
                e,
                ctx.log_tag()
            );
        }
    }

    /// 错误日志，空数据哨兵不打
    pub fn log_error(&self, ctx: &CallContext, op: &str, err: &MrCacheError) {
        if err.is_null_data() {
            return;
        }
        error!("{} {}失败: {}{}", self.plan.table, op, err, ctx.log_tag());
    }
}

/// 类型零值
pub(crate) fn zero_value(ty: FieldType) -> FieldValue {
    match ty {
        FieldType::Bool => FieldValue::Bool(false),
        FieldType::Int => FieldValue::Int(0),
        FieldType::UInt => FieldValue::UInt(0),
        FieldType::Float => FieldValue::Float(0.0),
        FieldType::String => FieldValue::String(String::new()),
        FieldType::Bytes => FieldValue::Bytes(Vec::new()),
    }
}

/// 单个Lua返回项转字段值，nil返回None
pub(crate) fn reply_to_value(item: &Value, ty: FieldType) -> MrResult<Option<FieldValue>> {
    match item {
        Value::Nil => Ok(None),
        Value::Data(bytes) => FieldValue::parse(ty, bytes).map(Some),
        Value::Int(i) => FieldValue::parse(ty, i.to_string().as_bytes()).map(Some),
        Value::Status(s) => FieldValue::parse(ty, s.as_bytes()).map(Some),
        other => Err(cache_error!(bind, format!("返回值形态异常: {:?}", other))),
    }
}

/// 返回值是否为nil（key不存在）
pub(crate) fn reply_is_nil(reply: &Value) -> bool {
    matches!(reply, Value::Nil)
}

/// 取出数组形态的返回值
pub(crate) fn reply_as_bulk(reply: Value) -> MrResult<Vec<Value>> {
    match reply {
        Value::Bulk(items) => Ok(items),
        other => Err(cache_error!(bind, format!("返回值不是数组: {:?}", other))),
    }
}

/// 状态返回值（OK/NULL）
pub(crate) fn reply_status(reply: &Value) -> Option<&str> {
    match reply {
        Value::Status(s) => Some(s.as_str()),
        Value::Okay => Some("OK"),
        Value::Data(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr_record;

    mr_record! {
        pub struct Item {
            "Id" => pub id: i64,
            "UID" => pub uid: i64,
            "Name" => pub name: String,
            "Age" => pub age: Option<i64>,
            "Score" => pub score: f64,
        }
    }

    fn plan() -> TablePlan {
        TablePlan::new("item", Item::layout())
    }

    #[test]
    fn test_check_cond() {
        let p = plan();
        assert!(p.check_cond(&Conds::new().eq("UID", 7i64), true).is_ok());
        assert!(p.check_cond(&Conds::new(), false).is_err());
        assert!(p.check_cond(&Conds::new().eq("Nope", 1i64), false).is_err());
        assert!(p.check_cond(&Conds::new().gt("UID", 7i64), true).is_err());
        assert!(p.check_cond(&Conds::new().gt("UID", 7i64), false).is_ok());
        assert!(p
            .check_cond(&Conds::new().eq("Name", 1i64), false)
            .is_err());
    }

    #[test]
    fn test_plan_key_uses_hash_tag() {
        let mut p = plan();
        p.config_hash_tag("UID").unwrap();
        let key = p
            .plan_key(CacheShape::Row, &Conds::new().eq("UID", 7i64), true)
            .unwrap();
        assert_eq!(key, "mrr_item_{7}");
    }

    #[test]
    fn test_check_data_sorted_by_layout() {
        let p = plan();
        let mut data = DataMap::new();
        data.insert("Age".to_string(), FieldValue::Int(1));
        data.insert("Name".to_string(), FieldValue::String("a".into()));
        let pairs = p.check_data(&data).unwrap();
        assert_eq!(pairs[0].0, 2); // Name在Age前面
        assert_eq!(pairs[1].0, 3);
        assert!(p.check_data(&DataMap::new()).is_err());
        let mut bad = DataMap::new();
        bad.insert("Name".to_string(), FieldValue::Int(1));
        assert!(p.check_data(&bad).is_err());
    }

    #[test]
    fn test_insert_args_fill_order() {
        let p = plan();
        let cond = Conds::new().eq("UID", 7i64);
        let data = vec![(2usize, FieldValue::String("a".into()))];
        let args = p.insert_args(&cond, &data, 42);
        assert_eq!(args[0], FieldValue::Int(42)); // 自增
        assert_eq!(args[1], FieldValue::Int(7)); // 条件
        assert_eq!(args[2], FieldValue::String("a".into())); // 数据
        assert_eq!(args[3], FieldValue::Null); // Age可空，取不到数据时用零值
        assert_eq!(args[4], FieldValue::Float(0.0));
    }

    #[test]
    fn test_set_ops_skips_and_translates_null() {
        let p = plan();
        let cond = Conds::new().eq("UID", 7i64);
        let pairs = vec![
            (0usize, FieldValue::Int(5)),              // 自增，跳过
            (1usize, FieldValue::Int(7)),              // 条件字段，跳过
            (2usize, FieldValue::String("a".into())),  // set
            (3usize, FieldValue::Null),                // del
        ];
        let ops = p.set_ops(&cond, &pairs, &[]);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].idx, 2);
        assert_eq!(ops[0].op, "set");
        assert_eq!(ops[1].idx, 3);
        assert_eq!(ops[1].op, "del");
    }

    #[test]
    fn test_modify_ops_kinds() {
        let p = plan();
        let cond = Conds::new().eq("UID", 7i64);
        let pairs = vec![
            (0usize, FieldValue::Int(5)),             // 自增，只读回
            (2usize, FieldValue::String("a".into())), // set
            (3usize, FieldValue::Int(2)),             // incr
            (4usize, FieldValue::Float(0.5)),         // fincr
        ];
        let ops = p.modify_ops(&cond, &pairs, &[]);
        assert_eq!(ops[0].op, "get");
        assert_eq!(ops[1].op, "set");
        assert_eq!(ops[2].op, "incr");
        assert_eq!(ops[3].op, "fincr");
        let args = p.ops_args(&ops);
        // 过期时间 + 每字段三元组
        assert_eq!(args.len(), 1 + 4 * 3);
    }

    #[test]
    fn test_zero_value() {
        assert_eq!(zero_value(FieldType::Int), FieldValue::Int(0));
        assert_eq!(zero_value(FieldType::String), FieldValue::String(String::new()));
    }

    #[test]
    fn test_reply_helpers() {
        assert!(reply_is_nil(&Value::Nil));
        assert!(!reply_is_nil(&Value::Okay));
        assert_eq!(reply_status(&Value::Okay), Some("OK"));
        assert_eq!(
            reply_status(&Value::Status("NULL".to_string())),
            Some("NULL")
        );
        let v = reply_to_value(&Value::Data(b"12".to_vec()), FieldType::Int).unwrap();
        assert_eq!(v, Some(FieldValue::Int(12)));
        let v = reply_to_value(&Value::Nil, FieldType::Int).unwrap();
        assert_eq!(v, None);
    }

    #[test]
    fn test_bind_reply_values() {
        let p = plan();
        let mut item = Item::default();
        let items = vec![
            Value::Data(b"9".to_vec()),
            Value::Nil,
            Value::Data(b"hello".to_vec()),
        ];
        p.bind_reply_values(&items, &[0, 1, 2], &mut item).unwrap();
        assert_eq!(item.id, 9);
        assert_eq!(item.uid, 0);
        assert_eq!(item.name, "hello");
        assert!(p.bind_reply_values(&items, &[0, 1], &mut item).is_err());
    }
}
