//! 列式缓存
//!
//! 查询条件对应多行数据，按列缓存：每个列一个hash，hash的field是行的
//! 自增id，value是这一行该列的值。自增列是主列，它的field集合就是全部
//! 行的id。适合行数多、单次只动少量列的场景。

use std::collections::HashMap;
use std::marker::PhantomData;

use redis::Value;

use crate::cache::{
    reply_as_bulk, reply_is_nil, reply_status, reply_to_value, CacheCore, DataMap, ScriptArgs,
};
use crate::cache_error;
use crate::error::{MrCacheError, MrResult};
use crate::keys;
use crate::mysql_adapter::MysqlAdapter;
use crate::redis_driver::pass::{del_pass, get_pass, set_pass};
use crate::redis_driver::RedisDriver;
use crate::schema::TableRecord;
use crate::script;
use crate::types::{CallContext, CondOp, Conds, FieldType, FieldValue};

/// 列式缓存，T为数据库行结构，可跨任务共享
pub struct CacheColumn<T: TableRecord> {
    core: CacheCore,
    _marker: PhantomData<T>,
}

impl<T: TableRecord> CacheColumn<T> {
    /// 创建列式缓存，默认把结构第一个字段当自增字段（主列）
    pub fn new(redis: RedisDriver, mysql: MysqlAdapter, table: &str) -> Self {
        Self {
            core: CacheCore::new::<T>(redis, mysql, table),
            _marker: PhantomData,
        }
    }

    /// 配置hashtag字段
    pub fn config_hash_tag(&mut self, field: &str) -> MrResult<()> {
        self.core.plan.config_hash_tag(field)
    }

    /// 配置自增字段（主列）和自增表名
    pub fn config_increment(&mut self, field: &str, increment_table: &str) -> MrResult<()> {
        self.core.plan.config_increment(field, increment_table)
    }

    /// 配置过期时间（秒）
    pub fn config_expire(&mut self, expire_secs: i64) -> MrResult<()> {
        self.core.plan.config_expire(expire_secs)
    }

    /// 配置自增分片
    pub fn config_shard(&mut self, shard_count: u32, shard_index: u32) -> MrResult<()> {
        self.core.plan.config_shard(shard_count, shard_index)
    }

    /// 配置附加查询条件
    pub fn config_query_cond(&mut self, cond: Conds) -> MrResult<()> {
        self.core.plan.config_query_cond(cond)
    }

    /// 配置单条件字段
    pub fn config_one_cond_field(&mut self, field: &str) -> MrResult<()> {
        self.core.plan.config_one_cond_field(field)
    }

    fn pivot_idx(&self) -> MrResult<usize> {
        self.core
            .plan
            .increment_field
            .ok_or_else(|| cache_error!(config, "列式缓存必须有自增字段"))
    }

    // 读 ///////////////////////////////////////////////////////////////////

    /// 读取查询条件下的全部行，确认无数据时返回空列表
    pub async fn get(&self, ctx: &CallContext, cond: &Conds) -> MrResult<Vec<T>> {
        match self.get_inner(ctx, cond).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Get", &e);
                Err(e)
            }
        }
    }

    /// 单条件版Get
    pub async fn get_oc<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: V,
    ) -> MrResult<Vec<T>> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.get(ctx, &cond).await
    }

    async fn get_inner(&self, ctx: &CallContext, cond: &Conds) -> MrResult<Vec<T>> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        let pivot = self.pivot_idx()?;

        if let Some(records) = self.redis_get_all(ctx, &column_keys, pivot).await? {
            return Ok(records);
        }
        if get_pass(&column_keys[0]) {
            return Ok(Vec::new());
        }
        match self.pre_load(ctx, cond, &column_keys).await? {
            Some(records) => {
                if records.is_empty() {
                    set_pass(&column_keys[0]);
                }
                Ok(records)
            }
            None => Ok(self
                .redis_get_all(ctx, &column_keys, pivot)
                .await?
                .unwrap_or_default()),
        }
    }

    /// 按自增id读取一行，确认无数据时返回None
    pub async fn get_one(&self, ctx: &CallContext, cond: &Conds, id: i64) -> MrResult<Option<T>> {
        match self.get_one_inner(ctx, cond, id).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "GetOne", &e);
                Err(e)
            }
        }
    }

    /// 单条件版GetOne
    pub async fn get_one_oc<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: V,
        id: i64,
    ) -> MrResult<Option<T>> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.get_one(ctx, &cond, id).await
    }

    async fn get_one_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        id: i64,
    ) -> MrResult<Option<T>> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        let pivot = self.pivot_idx()?;

        match self.redis_get_one(ctx, &column_keys, pivot, id).await? {
            ColumnOneReply::Found(record) => return Ok(Some(record)),
            // 主列没有这个id也走预加载，缓存可能落后于刚提交的插入
            ColumnOneReply::Absent | ColumnOneReply::Miss => {}
        }
        if get_pass(&column_keys[0]) {
            return Ok(None);
        }
        match self.pre_load(ctx, cond, &column_keys).await? {
            Some(records) => {
                if records.is_empty() {
                    set_pass(&column_keys[0]);
                }
                // 从预加载数据里找
                Ok(records
                    .into_iter()
                    .find(|r| r.get(pivot).as_i64() == Some(id)))
            }
            None => match self.redis_get_one(ctx, &column_keys, pivot, id).await? {
                ColumnOneReply::Found(record) => Ok(Some(record)),
                _ => Ok(None),
            },
        }
    }

    // 写 ///////////////////////////////////////////////////////////////////

    /// 直接插入一行并返回自增id，整组缓存作废等下次读取重建
    pub async fn add(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data: &DataMap,
    ) -> MrResult<(Option<T>, i64)> {
        match self.add_inner(ctx, cond, data).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Add", &e);
                Err(e)
            }
        }
    }

    async fn add_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data: &DataMap,
    ) -> MrResult<(Option<T>, i64)> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        let pivot = self.pivot_idx()?;
        let pairs = self.core.plan.check_data(data)?;
        let incr_value = self.core.add_to_mysql(ctx, cond, &pairs).await?;
        del_pass(&column_keys[0]);
        // 列内容已经不完整，整组作废
        self.core.redis.del_keys(ctx, &column_keys).await?;
        if ctx.no_resp {
            return Ok((None, incr_value));
        }
        let field = self.core.plan.layout.field(pivot).name;
        let row_cond = cond.clone().eq(field, incr_value);
        let record: T = self.core.get_from_mysql(&row_cond).await?;
        Ok((Some(record), incr_value))
    }

    /// 覆盖写一行的若干列，数据map必须带自增字段；自增值为0时配合
    /// create_on_miss走创建
    pub async fn set(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data: &DataMap,
    ) -> MrResult<(Option<T>, Option<i64>)> {
        match self.set_inner(ctx, cond, data).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Set", &e);
                Err(e)
            }
        }
    }

    /// 单条件版Set
    pub async fn set_oc<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: V,
        data: &DataMap,
    ) -> MrResult<(Option<T>, Option<i64>)> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.set(ctx, &cond, data).await
    }

    async fn set_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data: &DataMap,
    ) -> MrResult<(Option<T>, Option<i64>)> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        let pivot = self.pivot_idx()?;
        let pairs = self.core.plan.check_data(data)?;
        let id = self.data_pivot_id(&pairs, pivot)?;
        let args = self.set_args(cond, pivot, id, &pairs);
        let row_cond = self.row_cond(cond, pivot, id);

        match self
            .redis_set_to_mysql(ctx, &row_cond, &column_keys, &args, &pairs)
            .await
        {
            Ok(()) => return Ok((self.post_image(ctx, &row_cond, &pairs)?, None)),
            Err(MrCacheError::NullData) => {}
            Err(e) => return Err(e),
        }

        let (records, incr_value) = self.pre_load_write(ctx, cond, &column_keys, id, &pairs).await?;
        if let Some(new_id) = incr_value {
            // 创建完成，从预加载数据里找新行
            let record = records
                .into_iter()
                .find(|r| r.get(pivot).as_i64() == Some(new_id));
            if record.is_none() {
                return Err(MrCacheError::NullData);
            }
            return Ok((if ctx.no_resp { None } else { record }, incr_value));
        }

        // 再次写数据
        self.redis_set_to_mysql(ctx, &row_cond, &column_keys, &args, &pairs)
            .await?;
        Ok((self.post_image(ctx, &row_cond, &pairs)?, None))
    }

    /// 增量修改一行的若干列并返回修改后的值，数据map必须带自增字段
    pub async fn modify(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data: &DataMap,
    ) -> MrResult<(Option<T>, Option<i64>)> {
        match self.modify_inner(ctx, cond, data).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Modify", &e);
                Err(e)
            }
        }
    }

    /// 单条件版Modify
    pub async fn modify_oc<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: V,
        data: &DataMap,
    ) -> MrResult<(Option<T>, Option<i64>)> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.modify(ctx, &cond, data).await
    }

    async fn modify_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data: &DataMap,
    ) -> MrResult<(Option<T>, Option<i64>)> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        let pivot = self.pivot_idx()?;
        let pairs = self.core.plan.check_data(data)?;
        let id = self.data_pivot_id(&pairs, pivot)?;
        let args = self.modify_args(cond, pivot, id, &pairs);
        let row_cond = self.row_cond(cond, pivot, id);

        match self
            .redis_modify_to_mysql(ctx, &row_cond, &column_keys, &args, &pairs)
            .await
        {
            Ok(record) => return Ok((if ctx.no_resp { None } else { Some(record) }, None)),
            Err(MrCacheError::NullData) => {}
            Err(e) => return Err(e),
        }

        let (records, incr_value) = self.pre_load_write(ctx, cond, &column_keys, id, &pairs).await?;
        if let Some(new_id) = incr_value {
            let record = records
                .into_iter()
                .find(|r| r.get(pivot).as_i64() == Some(new_id));
            if record.is_none() {
                return Err(MrCacheError::NullData);
            }
            return Ok((if ctx.no_resp { None } else { record }, incr_value));
        }

        // 再次写数据
        let record = self
            .redis_modify_to_mysql(ctx, &row_cond, &column_keys, &args, &pairs)
            .await?;
        Ok((if ctx.no_resp { None } else { Some(record) }, None))
    }

    // 删 ///////////////////////////////////////////////////////////////////

    /// 删除整个查询的行（缓存+MySQL）
    pub async fn del(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        match self.del_inner(ctx, cond).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core.log_error(ctx, "Del", &e);
                Err(e)
            }
        }
    }

    async fn del_inner(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        self.core.redis.del_keys(ctx, &column_keys).await?;
        self.core.mysql.delete(&self.core.plan.table, cond).await?;
        del_pass(&column_keys[0]);
        Ok(())
    }

    /// 删除整个查询的缓存，MySQL不动
    pub async fn del_cache(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        let column_keys = self.core.plan.plan_column_keys(cond)?;
        let result = self.core.redis.del_keys(ctx, &column_keys).await;
        if let Err(e) = &result {
            self.core.log_error(ctx, "DelCache", e);
        }
        result
    }

    // 内部 /////////////////////////////////////////////////////////////////

    fn row_cond(&self, cond: &Conds, pivot: usize, id: i64) -> Conds {
        let field = self.core.plan.layout.field(pivot).name;
        cond.clone().eq(field, id)
    }

    /// 数据map里的自增字段值
    fn data_pivot_id(&self, pairs: &[(usize, FieldValue)], pivot: usize) -> MrResult<i64> {
        let field = self.core.plan.layout.field(pivot).name;
        pairs
            .iter()
            .find(|(idx, _)| *idx == pivot)
            .and_then(|(_, v)| v.as_i64())
            .ok_or_else(|| cache_error!(validation, field, "数据中必须包含自增字段"))
    }

    /// columnSet参数：ttl 主key位置 id (每个key)op value
    fn set_args(
        &self,
        cond: &Conds,
        pivot: usize,
        id: i64,
        pairs: &[(usize, FieldValue)],
    ) -> ScriptArgs {
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(pivot + 1); // lua下标
        args.push_i64(id);
        for i in 0..self.core.plan.layout.len() {
            let writable = i != pivot && cond.find(self.core.plan.layout.field(i).name).is_none();
            let value = pairs
                .iter()
                .find(|(idx, _)| *idx == i)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_null());
            match value {
                Some(v) if writable => {
                    args.push_str("set");
                    args.push_value(&v);
                }
                _ => {
                    args.push_str("");
                    args.push_str("");
                }
            }
        }
        args
    }

    /// columnModifyOne参数：ttl 主key位置 id (每个key)op value
    fn modify_args(
        &self,
        cond: &Conds,
        pivot: usize,
        id: i64,
        pairs: &[(usize, FieldValue)],
    ) -> ScriptArgs {
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(pivot + 1);
        args.push_i64(id);
        for i in 0..self.core.plan.layout.len() {
            let def = self.core.plan.layout.field(i);
            let read_only = i == pivot || cond.find(def.name).is_some();
            let value = pairs
                .iter()
                .find(|(idx, _)| *idx == i)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_null());
            match value {
                Some(v) if !read_only => {
                    let op = match def.ty {
                        FieldType::Int | FieldType::UInt => "incr",
                        FieldType::Float => "fincr",
                        _ => "set",
                    };
                    args.push_str(op);
                    args.push_value(&v);
                }
                _ => {
                    args.push_str("get");
                    args.push_str("");
                }
            }
        }
        args
    }

    async fn redis_get_all(
        &self,
        ctx: &CallContext,
        column_keys: &[String],
        pivot: usize,
    ) -> MrResult<Option<Vec<T>>> {
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(pivot + 1);
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "columnGet",
                &script::COLUMN_GET,
                column_keys,
                args.as_slice(),
            )
            .await?;
        if reply_is_nil(&reply) {
            return Ok(None);
        }
        match self.parse_columns(reply, pivot) {
            Ok(records) => Ok(Some(records)),
            Err(e) => {
                // 缓存内容和结构对不上，整组删掉重建
                self.core.compensate(ctx, column_keys).await;
                Err(e)
            }
        }
    }

    /// 按主列的id集合把列式数据拼回行
    fn parse_columns(&self, reply: Value, pivot: usize) -> MrResult<Vec<T>> {
        let columns = reply_as_bulk(reply)?;
        if columns.len() != self.core.plan.layout.len() {
            return Err(cache_error!(
                bind,
                format!(
                    "列数量{}和结构字段数量{}不一致",
                    columns.len(),
                    self.core.plan.layout.len()
                )
            ));
        }
        // 每列转成 id -> 值 的map，主列保留id顺序
        let mut column_maps: Vec<HashMap<String, FieldValue>> =
            Vec::with_capacity(columns.len());
        let mut pivot_ids: Vec<String> = Vec::new();
        for (i, column) in columns.into_iter().enumerate() {
            let flat = reply_as_bulk(column)?;
            let ty = self.core.plan.layout.field(i).ty;
            let mut map = HashMap::with_capacity(flat.len() / 2);
            let mut iter = flat.into_iter();
            while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
                let id = match &field {
                    Value::Data(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    Value::Int(v) => v.to_string(),
                    other => {
                        return Err(cache_error!(bind, format!("id形态异常: {:?}", other)))
                    }
                };
                if let Some(v) = reply_to_value(&value, ty)? {
                    if i == pivot {
                        pivot_ids.push(id.clone());
                    }
                    map.insert(id, v);
                }
            }
            column_maps.push(map);
        }

        let mut records = Vec::with_capacity(pivot_ids.len());
        for id in &pivot_ids {
            let mut record = T::default();
            for (i, map) in column_maps.iter().enumerate() {
                if let Some(v) = map.get(id) {
                    record.set(i, v)?;
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn redis_get_one(
        &self,
        ctx: &CallContext,
        column_keys: &[String],
        pivot: usize,
        id: i64,
    ) -> MrResult<ColumnOneReply<T>> {
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(pivot + 1);
        args.push_i64(id);
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "columnGetOne",
                &script::COLUMN_GET_ONE,
                column_keys,
                args.as_slice(),
            )
            .await?;
        if reply_is_nil(&reply) {
            return Ok(ColumnOneReply::Miss);
        }
        let mut parts = reply_as_bulk(reply)?.into_iter();
        let status = parts
            .next()
            .and_then(|p| reply_as_bulk(p).ok())
            .and_then(|p| p.into_iter().next());
        match status.as_ref().and_then(reply_status) {
            Some("OK") => {}
            Some("NULL") => return Ok(ColumnOneReply::Absent),
            other => {
                return Err(cache_error!(bind, format!("状态形态异常: {:?}", other)));
            }
        }
        let values = parts
            .next()
            .ok_or_else(|| cache_error!(bind, "缺少数据段"))?;
        let items = reply_as_bulk(values)?;
        let idxs: Vec<usize> = (0..self.core.plan.layout.len()).collect();
        let mut record = T::default();
        match self.core.plan.bind_reply_values(&items, &idxs, &mut record) {
            Ok(()) => Ok(ColumnOneReply::Found(record)),
            Err(e) => {
                self.core.compensate(ctx, column_keys).await;
                Err(e)
            }
        }
    }

    async fn pre_load(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        column_keys: &[String],
    ) -> MrResult<Option<Vec<T>>> {
        let lock_key = keys::lock_key(&column_keys[0]);
        match self
            .core
            .locks
            .try_lock_wait(&self.core.redis, &lock_key)
            .await?
        {
            Some(guard) => {
                let result = self.load_all_to_redis(ctx, cond, column_keys).await;
                self.core.locks.release(guard).await;
                result.map(Some)
            }
            None => Ok(None),
        }
    }

    /// 写路径预加载：create_on_miss时独占锁，行不存在就带数据插入
    async fn pre_load_write(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        column_keys: &[String],
        id: i64,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<(Vec<T>, Option<i64>)> {
        let lock_key = keys::lock_key(&column_keys[0]);
        if ctx.create_on_miss {
            let guard = self.core.locks.lock(&self.core.redis, &lock_key).await?;
            let result = self.load_or_create(ctx, cond, column_keys, id, pairs).await;
            self.core.locks.release(guard).await;
            result
        } else {
            match self
                .core
                .locks
                .try_lock_wait(&self.core.redis, &lock_key)
                .await?
            {
                Some(guard) => {
                    let result = self.load_all_to_redis(ctx, cond, column_keys).await;
                    self.core.locks.release(guard).await;
                    result.map(|records| (records, None))
                }
                None => Ok((Vec::new(), None)),
            }
        }
    }

    async fn load_or_create(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        column_keys: &[String],
        id: i64,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<(Vec<T>, Option<i64>)> {
        let pivot = self.pivot_idx()?;
        let row_cond = self.row_cond(cond, pivot, id);
        let mut incr_value = None;
        match self.core.get_from_mysql::<T>(&row_cond).await {
            Ok(_) => {}
            Err(MrCacheError::NullData) => {
                let new_id = self.core.add_to_mysql(ctx, cond, pairs).await?;
                del_pass(&column_keys[0]);
                incr_value = Some(new_id);
            }
            Err(e) => return Err(e),
        }
        let records = self.load_all_to_redis(ctx, cond, column_keys).await?;
        Ok((records, incr_value))
    }

    /// MySQL读全量并按列写入Redis
    async fn load_all_to_redis(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        column_keys: &[String],
    ) -> MrResult<Vec<T>> {
        let pivot = self.pivot_idx()?;
        let records: Vec<T> = self.core.gets_from_mysql(cond).await?;
        if records.is_empty() {
            // 无数据不建key
            return Ok(records);
        }

        let mut columns: Vec<Vec<(String, FieldValue)>> =
            vec![Vec::new(); self.core.plan.layout.len()];
        for record in &records {
            let id_value = record.get(pivot);
            if id_value.is_null() {
                continue;
            }
            let id_str = id_value.to_string();
            for (i, column) in columns.iter_mut().enumerate() {
                let value = record.get(i);
                if value.is_null() {
                    continue; // 空值不写入
                }
                column.push((id_str.clone(), value));
            }
        }

        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        for column in &columns {
            args.push_usize(column.len() * 2);
            for (id_str, value) in column {
                args.push_str(id_str);
                args.push_value(value);
            }
        }

        if let Err(e) = self
            .core
            .redis
            .run_script(
                ctx,
                "columnAdd",
                &script::COLUMN_ADD,
                column_keys,
                args.as_slice(),
            )
            .await
        {
            self.core.compensate(ctx, column_keys).await;
            return Err(e);
        }
        Ok(records)
    }

    /// Lua写缓存成功后同步MySQL，MySQL失败删整组key
    async fn redis_set_to_mysql(
        &self,
        ctx: &CallContext,
        row_cond: &Conds,
        column_keys: &[String],
        args: &ScriptArgs,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<()> {
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "columnSet",
                &script::COLUMN_SET,
                column_keys,
                args.as_slice(),
            )
            .await?;
        if reply_is_nil(&reply) {
            return Err(MrCacheError::NullData);
        }
        match reply_status(&reply) {
            Some("OK") => {}
            Some("NULL") => {
                // 缓存在但没有这个id的行
                if ctx.create_on_miss {
                    return Err(MrCacheError::NullData); // 走创建流程
                }
                return Err(cache_error!(validation, "id", "自增id对应的行不存在"));
            }
            other => {
                return Err(cache_error!(bind, format!("状态形态异常: {:?}", other)));
            }
        }
        if let Err(e) = self.core.save_to_mysql(row_cond, pairs).await {
            self.core.compensate(ctx, column_keys).await;
            return Err(e);
        }
        Ok(())
    }

    /// Lua修改并读回最新值，同步MySQL；绑定失败或MySQL失败都删整组key
    async fn redis_modify_to_mysql(
        &self,
        ctx: &CallContext,
        row_cond: &Conds,
        column_keys: &[String],
        args: &ScriptArgs,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<T> {
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "columnModifyOne",
                &script::COLUMN_MODIFY_ONE,
                column_keys,
                args.as_slice(),
            )
            .await?;
        if reply_is_nil(&reply) {
            return Err(MrCacheError::NullData);
        }
        let mut parts = reply_as_bulk(reply)?.into_iter();
        let status = parts
            .next()
            .and_then(|p| reply_as_bulk(p).ok())
            .and_then(|p| p.into_iter().next());
        match status.as_ref().and_then(reply_status) {
            Some("OK") => {}
            Some("NULL") => {
                if ctx.create_on_miss {
                    return Err(MrCacheError::NullData);
                }
                return Err(cache_error!(validation, "id", "自增id对应的行不存在"));
            }
            other => {
                return Err(cache_error!(bind, format!("状态形态异常: {:?}", other)));
            }
        }
        let values = parts
            .next()
            .ok_or_else(|| cache_error!(bind, "缺少数据段"))?;
        let items = reply_as_bulk(values)?;
        let idxs: Vec<usize> = (0..self.core.plan.layout.len()).collect();
        let mut record = T::default();
        if let Err(e) = self.core.plan.bind_reply_values(&items, &idxs, &mut record) {
            // 绑定失败说明缓存内容和MySQL对不上了，整组删掉
            self.core.compensate(ctx, column_keys).await;
            return Err(e);
        }
        let touched: Vec<(usize, FieldValue)> = pairs
            .iter()
            .map(|(idx, _)| (*idx, record.get(*idx)))
            .collect();
        if let Err(e) = self.core.save_to_mysql(row_cond, &touched).await {
            self.core.compensate(ctx, column_keys).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Set的返回镜像
    fn post_image(
        &self,
        ctx: &CallContext,
        row_cond: &Conds,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<Option<T>> {
        if ctx.no_resp {
            return Ok(None);
        }
        let mut record = T::default();
        for item in row_cond.items() {
            if item.op == CondOp::Eq {
                if let Some(idx) = self.core.plan.layout.find(&item.field) {
                    record.set(idx, &item.value)?;
                }
            }
        }
        for (idx, value) in pairs {
            record.set(*idx, value)?;
        }
        Ok(Some(record))
    }
}

/// 单条读取的三种结果
enum ColumnOneReply<T> {
    /// 命中
    Found(T),
    /// 主列在，id不在；缓存可能落后于刚提交的插入，仍需回源确认
    Absent,
    /// 主key不存在，需要加载
    Miss,
}
