//! 多行缓存
//!
//! 查询条件对应多行数据。一个索引hash记录数据key值到数据key名的映射，
//! 每行再占一个hash。索引key和数据key的过期时间可能不同步，索引在而
//! 数据不在时脚本返回nil，走重新加载。查询条件和数据key字段最好有
//! 唯一索引。

use std::marker::PhantomData;

use crate::cache::{
    reply_as_bulk, reply_is_nil, reply_status, CacheCore, DataMap, ScriptArgs,
};
use crate::cache_error;
use crate::error::{MrCacheError, MrResult};
use crate::keys::{self, CacheShape};
use crate::mysql_adapter::MysqlAdapter;
use crate::redis_driver::pass::{del_pass, get_pass, set_pass};
use crate::redis_driver::RedisDriver;
use crate::schema::TableRecord;
use crate::script;
use crate::types::{CallContext, CondOp, Conds, FieldValue};

/// 单条读取的三种结果
enum RowsReply<T> {
    /// 命中
    Found(T),
    /// 索引在，行不在；索引可能落后于刚提交的插入，仍需回源确认
    Absent,
    /// 索引key不存在，需要加载
    Miss,
}

/// 多行缓存，T为数据库行结构，可跨任务共享
pub struct CacheRows<T: TableRecord> {
    core: CacheCore,
    /// 数据key字段索引，该字段的值在一个查询的结果集里必须唯一
    data_key_field: Option<usize>,
    _marker: PhantomData<T>,
}

impl<T: TableRecord> CacheRows<T> {
    /// 创建多行缓存，默认把结构第一个字段当自增字段和数据key字段
    pub fn new(redis: RedisDriver, mysql: MysqlAdapter, table: &str) -> Self {
        let core = CacheCore::new::<T>(redis, mysql, table);
        let data_key_field = core
            .plan
            .layout
            .fields()
            .first()
            .filter(|def| def.ty.is_base())
            .map(|_| 0);
        Self {
            core,
            data_key_field,
            _marker: PhantomData,
        }
    }

    /// 配置数据key字段，只接受基础类型（bool/整数/字符串/字节）
    pub fn config_data_key_field(&mut self, field: &str) -> MrResult<()> {
        let idx = self.core.plan.layout.find(field).ok_or_else(|| {
            cache_error!(
                validation,
                field,
                format!("tag不存在于{}的结构中", self.core.plan.table)
            )
        })?;
        if !self.core.plan.layout.is_base_type(idx) {
            return Err(cache_error!(validation, field, "数据key字段必须是基础类型"));
        }
        self.data_key_field = Some(idx);
        Ok(())
    }

    /// 配置hashtag字段
    pub fn config_hash_tag(&mut self, field: &str) -> MrResult<()> {
        self.core.plan.config_hash_tag(field)
    }

    /// 配置自增字段和自增表名
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

    fn data_key_idx(&self) -> MrResult<usize> {
        self.data_key_field
            .ok_or_else(|| cache_error!(config, "需要先配置data_key_field"))
    }

    /// 校验数据key值并转成key后缀
    fn check_data_key_value(&self, value: &FieldValue) -> MrResult<String> {
        let idx = self.data_key_idx()?;
        if value.is_null() {
            return Err(cache_error!(validation, "data_key", "数据key值不能为空"));
        }
        self.core.plan.layout.check_value(idx, value)?;
        Ok(value.to_string())
    }

    fn row_cond(&self, cond: &Conds, dkv: &FieldValue) -> MrResult<Conds> {
        let idx = self.data_key_idx()?;
        let field = self.core.plan.layout.field(idx).name;
        Ok(cond.clone().eq(field, dkv.clone()))
    }

    // 读 ///////////////////////////////////////////////////////////////////

    /// 读取查询条件下的全部行，确认无数据时返回空列表
    pub async fn get_all(&self, ctx: &CallContext, cond: &Conds) -> MrResult<Vec<T>> {
        match self.get_all_inner(ctx, cond).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "GetAll", &e);
                Err(e)
            }
        }
    }

    /// 单条件版GetAll
    pub async fn get_all_oc<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: V,
    ) -> MrResult<Vec<T>> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.get_all(ctx, &cond).await
    }

    async fn get_all_inner(&self, ctx: &CallContext, cond: &Conds) -> MrResult<Vec<T>> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        self.data_key_idx()?;

        if let Some(records) = self.redis_get_all(ctx, &key).await? {
            return Ok(records);
        }
        if get_pass(&key) {
            return Ok(Vec::new());
        }
        match self.pre_load_all(ctx, cond, &key).await? {
            Some(records) => {
                if records.is_empty() {
                    set_pass(&key);
                }
                Ok(records)
            }
            // 别人加载的，重读一次
            None => Ok(self.redis_get_all(ctx, &key).await?.unwrap_or_default()),
        }
    }

    /// 按数据key值读取一行，确认无数据时返回None
    pub async fn get<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_key_value: V,
    ) -> MrResult<Option<T>> {
        let dkv = data_key_value.into();
        match self.get_inner(ctx, cond, &dkv).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Get", &e);
                Err(e)
            }
        }
    }

    /// 单条件版Get
    pub async fn get_oc<C: Into<FieldValue>, V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: C,
        data_key_value: V,
    ) -> MrResult<Option<T>> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.get(ctx, &cond, data_key_value).await
    }

    async fn get_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        dkv: &FieldValue,
    ) -> MrResult<Option<T>> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let dkv_str = self.check_data_key_value(dkv)?;

        match self.redis_get_one(ctx, &key, &dkv_str).await? {
            RowsReply::Found(record) => return Ok(Some(record)),
            // 索引没有这行也走预加载，索引可能落后于刚提交的插入
            RowsReply::Absent | RowsReply::Miss => {}
        }
        if get_pass(&key) {
            return Ok(None);
        }
        // 预加载这一行，顺带重建索引
        let lock_key = keys::lock_key(&key);
        match self
            .core
            .locks
            .try_lock_wait(&self.core.redis, &lock_key)
            .await?
        {
            Some(guard) => {
                let result = self.load_one_to_redis(ctx, cond, &key, dkv).await;
                self.core.locks.release(guard).await;
                match result {
                    Ok(record) => Ok(Some(record)),
                    // 只是这一行没有，不能给整个查询记空结果备忘
                    Err(MrCacheError::NullData) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            None => match self.redis_get_one(ctx, &key, &dkv_str).await? {
                RowsReply::Found(record) => Ok(Some(record)),
                _ => Ok(None),
            },
        }
    }

    /// 批量按数据key值读取，索引中不存在的跳过
    pub async fn gets(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_key_values: &[FieldValue],
    ) -> MrResult<Vec<T>> {
        match self.gets_inner(ctx, cond, data_key_values).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Gets", &e);
                Err(e)
            }
        }
    }

    async fn gets_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_key_values: &[FieldValue],
    ) -> MrResult<Vec<T>> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let mut dkv_strs = Vec::with_capacity(data_key_values.len());
        for dkv in data_key_values {
            dkv_strs.push(self.check_data_key_value(dkv)?);
        }

        if let Some(records) = self.redis_gets(ctx, &key, &dkv_strs).await? {
            return Ok(records);
        }
        if get_pass(&key) {
            return Ok(Vec::new());
        }
        match self.pre_load_all(ctx, cond, &key).await? {
            Some(records) => {
                if records.is_empty() {
                    set_pass(&key);
                }
                // 从全量里挑出要的
                let idx = self.data_key_idx()?;
                Ok(records
                    .into_iter()
                    .filter(|r| dkv_strs.iter().any(|s| *s == r.get(idx).to_string()))
                    .collect())
            }
            None => Ok(self
                .redis_gets(ctx, &key, &dkv_strs)
                .await?
                .unwrap_or_default()),
        }
    }

    /// 行是否存在；不会建缓存，未命中时直接查MySQL
    pub async fn exist<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_key_value: V,
    ) -> MrResult<bool> {
        let dkv = data_key_value.into();
        match self.exist_inner(ctx, cond, &dkv).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Exist", &e);
                Err(e)
            }
        }
    }

    async fn exist_inner(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        dkv: &FieldValue,
    ) -> MrResult<bool> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let dkv_str = self.check_data_key_value(dkv)?;
        match self.redis_get_one(ctx, &key, &dkv_str).await? {
            RowsReply::Found(_) => Ok(true),
            // 索引没有这行也查MySQL确认，索引可能落后于刚提交的插入
            RowsReply::Absent | RowsReply::Miss => {
                if get_pass(&key) {
                    return Ok(false);
                }
                let row_cond = self.row_cond(cond, dkv)?;
                match self.core.get_from_mysql::<T>(&row_cond).await {
                    Ok(_) => Ok(true),
                    Err(MrCacheError::NullData) => Ok(false),
                    Err(e) => Err(e),
                }
            }
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
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let (pairs, dkv) = self.check_data_with_key(data)?;
        let incr_value = self.core.add_to_mysql(ctx, cond, &pairs).await?;
        del_pass(&key);
        // 索引已经不完整，连同数据key一起清掉
        let script_keys = [key.clone()];
        self.core
            .redis
            .run_script(
                ctx,
                "rowsDelAll",
                &script::ROWS_DEL_ALL,
                &script_keys,
                ScriptArgs::new().as_slice(),
            )
            .await?;
        if ctx.no_resp {
            return Ok((None, incr_value));
        }
        let row_cond = self.row_cond(cond, &dkv)?;
        let record: T = self.core.get_from_mysql(&row_cond).await?;
        Ok((Some(record), incr_value))
    }

    /// 覆盖写一行的若干字段，数据map必须带数据key字段
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
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let (pairs, dkv) = self.check_data_with_key(data)?;
        let dk_idx = self.data_key_idx()?;
        let data_key = keys::data_key(&key, &dkv.to_string());
        let row_cond = self.row_cond(cond, &dkv)?;
        let ops = self.core.plan.set_ops(cond, &pairs, &[dk_idx]);
        let args = self.core.plan.ops_args(&ops);

        match self
            .redis_set_to_mysql(ctx, &row_cond, &key, &data_key, &args, &pairs)
            .await
        {
            Ok(()) => return Ok((self.post_image(ctx, &row_cond, &pairs, None)?, None)),
            Err(MrCacheError::NullData) => {}
            Err(e) => return Err(e),
        }

        let (loaded, incr_value) = self.pre_load_write(ctx, cond, &key, &dkv, &pairs).await?;
        if incr_value.is_some() {
            // 创建路径：数据已经落库并加载完成
            let record = if ctx.no_resp { None } else { loaded };
            return Ok((record, incr_value));
        }

        // 再次写数据
        self.redis_set_to_mysql(ctx, &row_cond, &key, &data_key, &args, &pairs)
            .await?;
        Ok((self.post_image(ctx, &row_cond, &pairs, None)?, None))
    }

    /// 增量修改一行的若干字段并返回修改后的值，数据map必须带数据key字段
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
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let (pairs, dkv) = self.check_data_with_key(data)?;
        let dk_idx = self.data_key_idx()?;
        let data_key = keys::data_key(&key, &dkv.to_string());
        let row_cond = self.row_cond(cond, &dkv)?;
        let ops = self.core.plan.modify_ops(cond, &pairs, &[dk_idx]);
        let args = self.core.plan.ops_args(&ops);
        let field_idxs: Vec<usize> = ops.iter().map(|o| o.idx).collect();

        match self
            .redis_modify_to_mysql(ctx, &row_cond, &key, &data_key, &args, &field_idxs)
            .await
        {
            Ok(record) => return Ok((if ctx.no_resp { None } else { Some(record) }, None)),
            Err(MrCacheError::NullData) => {}
            Err(e) => return Err(e),
        }

        let (loaded, incr_value) = self.pre_load_write(ctx, cond, &key, &dkv, &pairs).await?;
        if incr_value.is_some() {
            // 创建路径：预加载的数据就是最新值
            let record = if ctx.no_resp { None } else { loaded };
            return Ok((record, incr_value));
        }

        // 再次写数据
        let record = self
            .redis_modify_to_mysql(ctx, &row_cond, &key, &data_key, &args, &field_idxs)
            .await?;
        Ok((if ctx.no_resp { None } else { Some(record) }, None))
    }

    // 删 ///////////////////////////////////////////////////////////////////

    /// 删除一行（缓存+MySQL）
    pub async fn del<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_key_value: V,
    ) -> MrResult<()> {
        let dkv = data_key_value.into();
        match self.del_inner(ctx, cond, &dkv).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core.log_error(ctx, "Del", &e);
                Err(e)
            }
        }
    }

    async fn del_inner(&self, ctx: &CallContext, cond: &Conds, dkv: &FieldValue) -> MrResult<()> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let dkv_str = self.check_data_key_value(dkv)?;
        self.del_cache_entry(ctx, &key, &dkv_str).await?;
        let row_cond = self.row_cond(cond, dkv)?;
        self.core.mysql.delete(&self.core.plan.table, &row_cond).await?;
        del_pass(&key);
        Ok(())
    }

    /// 删除一行的缓存，MySQL不动
    pub async fn del_cache<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        data_key_value: V,
    ) -> MrResult<()> {
        let dkv = data_key_value.into();
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let dkv_str = self.check_data_key_value(&dkv)?;
        let result = self.del_cache_entry(ctx, &key, &dkv_str).await;
        if let Err(e) = &result {
            self.core.log_error(ctx, "DelCache", e);
        }
        result
    }

    /// 删除整个查询的所有行（缓存+MySQL）
    pub async fn del_all(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        match self.del_all_inner(ctx, cond).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core.log_error(ctx, "DelAll", &e);
                Err(e)
            }
        }
    }

    async fn del_all_inner(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let script_keys = [key.clone()];
        self.core
            .redis
            .run_script(
                ctx,
                "rowsDelAll",
                &script::ROWS_DEL_ALL,
                &script_keys,
                ScriptArgs::new().as_slice(),
            )
            .await?;
        self.core.mysql.delete(&self.core.plan.table, cond).await?;
        del_pass(&key);
        Ok(())
    }

    /// 删除整个查询的缓存，MySQL不动
    pub async fn del_cache_all(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        let key = self.core.plan.plan_key(CacheShape::Rows, cond, true)?;
        let script_keys = [key];
        let result = self
            .core
            .redis
            .run_script(
                ctx,
                "rowsDelAll",
                &script::ROWS_DEL_ALL,
                &script_keys,
                ScriptArgs::new().as_slice(),
            )
            .await
            .map(|_| ());
        if let Err(e) = &result {
            self.core.log_error(ctx, "DelCacheAll", e);
        }
        result
    }

    // 内部 /////////////////////////////////////////////////////////////////

    /// 数据map校验，并取出数据key字段的值
    fn check_data_with_key(&self, data: &DataMap) -> MrResult<(Vec<(usize, FieldValue)>, FieldValue)> {
        let dk_idx = self.data_key_idx()?;
        let pairs = self.core.plan.check_data(data)?;
        let dkv = pairs
            .iter()
            .find(|(idx, _)| *idx == dk_idx)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                cache_error!(
                    validation,
                    self.core.plan.layout.field(dk_idx).name,
                    "数据中必须包含数据key字段"
                )
            })?;
        if dkv.is_null() {
            return Err(cache_error!(validation, "data_key", "数据key值不能为空"));
        }
        Ok((pairs, dkv))
    }

    async fn del_cache_entry(&self, ctx: &CallContext, key: &str, dkv_str: &str) -> MrResult<()> {
        let data_key = keys::data_key(key, dkv_str);
        let script_keys = [key.to_string(), data_key];
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_str(dkv_str);
        self.core
            .redis
            .run_script(ctx, "rowsDel", &script::ROWS_DEL, &script_keys, args.as_slice())
            .await?;
        Ok(())
    }

    async fn redis_get_all(&self, ctx: &CallContext, key: &str) -> MrResult<Option<Vec<T>>> {
        let args = self.core.plan.tag_args();
        let script_keys = [key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "rowsGetAll",
                &script::ROWS_GET_ALL,
                &script_keys,
                args.as_slice(),
            )
            .await?;
        if reply_is_nil(&reply) {
            return Ok(None);
        }
        self.bind_rows(ctx, &script_keys, reply).await.map(Some)
    }

    async fn redis_gets(
        &self,
        ctx: &CallContext,
        key: &str,
        dkv_strs: &[String],
    ) -> MrResult<Option<Vec<T>>> {
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(dkv_strs.len());
        for s in dkv_strs {
            args.push_str(s);
        }
        for def in self.core.plan.layout.fields() {
            args.push_str(def.name);
        }
        let script_keys = [key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(ctx, "rowsGets", &script::ROWS_GETS, &script_keys, args.as_slice())
            .await?;
        if reply_is_nil(&reply) {
            return Ok(None);
        }
        self.bind_rows(ctx, &script_keys, reply).await.map(Some)
    }

    /// 把{value..}数组列表绑定成记录列表，绑定失败删索引key重建
    async fn bind_rows(
        &self,
        ctx: &CallContext,
        script_keys: &[String],
        reply: redis::Value,
    ) -> MrResult<Vec<T>> {
        let idxs: Vec<usize> = (0..self.core.plan.layout.len()).collect();
        let result = (|| -> MrResult<Vec<T>> {
            let rows = reply_as_bulk(reply)?;
            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                let items = reply_as_bulk(row)?;
                let mut record = T::default();
                self.core.plan.bind_reply_values(&items, &idxs, &mut record)?;
                records.push(record);
            }
            Ok(records)
        })();
        if result.is_err() {
            self.core.compensate(ctx, script_keys).await;
        }
        result
    }

    async fn redis_get_one(
        &self,
        ctx: &CallContext,
        key: &str,
        dkv_str: &str,
    ) -> MrResult<RowsReply<T>> {
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_str(dkv_str);
        for def in self.core.plan.layout.fields() {
            args.push_str(def.name);
        }
        let script_keys = [key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(ctx, "rowsGet", &script::ROWS_GET, &script_keys, args.as_slice())
            .await?;
        if reply_is_nil(&reply) {
            return Ok(RowsReply::Miss);
        }
        if reply_status(&reply) == Some("NULL") {
            return Ok(RowsReply::Absent);
        }
        let items = reply_as_bulk(reply)?;
        let idxs: Vec<usize> = (0..self.core.plan.layout.len()).collect();
        let mut record = T::default();
        match self.core.plan.bind_reply_values(&items, &idxs, &mut record) {
            Ok(()) => Ok(RowsReply::Found(record)),
            Err(e) => {
                let data_key = keys::data_key(key, dkv_str);
                self.core.compensate(ctx, &[data_key]).await;
                Err(e)
            }
        }
    }

    async fn pre_load_all(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
    ) -> MrResult<Option<Vec<T>>> {
        let lock_key = keys::lock_key(key);
        match self
            .core
            .locks
            .try_lock_wait(&self.core.redis, &lock_key)
            .await?
        {
            Some(guard) => {
                let result = self.load_all_to_redis(ctx, cond, key).await;
                self.core.locks.release(guard).await;
                result.map(Some)
            }
            None => Ok(None),
        }
    }

    /// MySQL读全量并写入Redis（索引+每行）
    async fn load_all_to_redis(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
    ) -> MrResult<Vec<T>> {
        let records: Vec<T> = self.core.gets_from_mysql(cond).await?;
        if records.is_empty() {
            // 无数据不建索引
            return Ok(records);
        }
        let dk_idx = self.data_key_idx()?;

        let mut script_keys = Vec::with_capacity(1 + records.len());
        script_keys.push(key.to_string());
        let mut index_kv: Vec<(String, String)> = Vec::with_capacity(records.len());
        let mut per_row: Vec<Vec<(usize, FieldValue)>> = Vec::with_capacity(records.len());
        for record in &records {
            let dkv = record.get(dk_idx);
            if dkv.is_null() {
                continue; // 理论上不应该，忽略这条
            }
            let dkv_str = dkv.to_string();
            let data_key = keys::data_key(key, &dkv_str);
            script_keys.push(data_key.clone());
            index_kv.push((dkv_str, data_key));
            per_row.push(self.core.plan.record_kv_pairs(record));
        }

        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(index_kv.len() * 2);
        for (dkv_str, data_key) in &index_kv {
            args.push_str(dkv_str);
            args.push_str(data_key);
        }
        for pairs in &per_row {
            args.push_usize(pairs.len() * 2);
            for (idx, value) in pairs {
                args.push_str(self.core.plan.layout.field(*idx).name);
                args.push_value(value);
            }
        }

        if let Err(e) = self
            .core
            .redis
            .run_script(ctx, "rowsAdd", &script::ROWS_ADD, &script_keys, args.as_slice())
            .await
        {
            self.core.compensate(ctx, &script_keys).await;
            return Err(e);
        }
        Ok(records)
    }

    /// MySQL读一行并写入Redis，索引用全量数据key值重建
    async fn load_one_to_redis(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
        dkv: &FieldValue,
    ) -> MrResult<T> {
        let dk_idx = self.data_key_idx()?;
        let row_cond = self.row_cond(cond, dkv)?;
        let record: T = self.core.get_from_mysql(&row_cond).await?;
        // 覆盖索引就能查到全部数据key值
        let all_dkvs = self
            .core
            .mysql
            .select_field(
                &self.core.plan.table,
                self.core.plan.layout,
                dk_idx,
                cond,
                &self.core.plan.query_cond,
            )
            .await?;

        let dkv_str = dkv.to_string();
        let data_key = keys::data_key(key, &dkv_str);
        let script_keys = vec![key.to_string(), data_key];

        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        args.push_usize(all_dkvs.len() * 2);
        for v in &all_dkvs {
            let s = v.to_string();
            args.push_str(&s);
            args.push_str(&keys::data_key(key, &s));
        }
        let pairs = self.core.plan.record_kv_pairs(&record);
        args.push_usize(pairs.len() * 2);
        for (idx, value) in &pairs {
            args.push_str(self.core.plan.layout.field(*idx).name);
            args.push_value(value);
        }

        if let Err(e) = self
            .core
            .redis
            .run_script(ctx, "rowsAdd", &script::ROWS_ADD, &script_keys, args.as_slice())
            .await
        {
            self.core.compensate(ctx, &script_keys).await;
            return Err(e);
        }
        Ok(record)
    }

    /// 写路径预加载：create_on_miss时独占锁，确认不存在就带数据插入
    async fn pre_load_write(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
        dkv: &FieldValue,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<(Option<T>, Option<i64>)> {
        let lock_key = keys::lock_key(key);
        if ctx.create_on_miss {
            let guard = self.core.locks.lock(&self.core.redis, &lock_key).await?;
            let result = self.load_or_create(ctx, cond, key, dkv, pairs).await;
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
                    let result = self.load_one_to_redis(ctx, cond, key, dkv).await;
                    self.core.locks.release(guard).await;
                    // 不创建时无数据就报空
                    result.map(|record| (Some(record), None))
                }
                None => Ok((None, None)),
            }
        }
    }

    async fn load_or_create(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
        dkv: &FieldValue,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<(Option<T>, Option<i64>)> {
        let row_cond = self.row_cond(cond, dkv)?;
        let mut incr_value = None;
        match self.core.get_from_mysql::<T>(&row_cond).await {
            Ok(_) => {}
            Err(MrCacheError::NullData) => {
                // 带上数据插入，数据里含数据key字段
                let id = self.core.add_to_mysql(ctx, cond, pairs).await?;
                del_pass(key);
                incr_value = Some(id);
            }
            Err(e) => return Err(e),
        }
        let record = self.load_one_to_redis(ctx, cond, key, dkv).await?;
        Ok((Some(record), incr_value))
    }

    /// Lua写缓存成功后同步MySQL，MySQL失败删数据key
    async fn redis_set_to_mysql(
        &self,
        ctx: &CallContext,
        row_cond: &Conds,
        key: &str,
        data_key: &str,
        args: &ScriptArgs,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<()> {
        let script_keys = [key.to_string(), data_key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(ctx, "rowsSet", &script::ROWS_SET, &script_keys, args.as_slice())
            .await?;
        if reply_is_nil(&reply) {
            return Err(MrCacheError::NullData);
        }
        if let Err(e) = self.core.save_to_mysql(row_cond, pairs).await {
            self.core.compensate(ctx, &[data_key.to_string()]).await;
            return Err(e);
        }
        Ok(())
    }

    /// Lua修改并读回最新值，同步MySQL；绑定失败或MySQL失败都删数据key
    async fn redis_modify_to_mysql(
        &self,
        ctx: &CallContext,
        row_cond: &Conds,
        key: &str,
        data_key: &str,
        args: &ScriptArgs,
        field_idxs: &[usize],
    ) -> MrResult<T> {
        let script_keys = [key.to_string(), data_key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "rowsModify",
                &script::ROWS_MODIFY,
                &script_keys,
                args.as_slice(),
            )
            .await?;
        if reply_is_nil(&reply) {
            return Err(MrCacheError::NullData);
        }
        let items = reply_as_bulk(reply)?;
        let mut record = T::default();
        if let Err(e) = self
            .core
            .plan
            .bind_reply_values(&items, field_idxs, &mut record)
        {
            self.core.compensate(ctx, &[data_key.to_string()]).await;
            return Err(e);
        }
        let touched: Vec<(usize, FieldValue)> =
            field_idxs.iter().map(|i| (*i, record.get(*i))).collect();
        if let Err(e) = self.core.save_to_mysql(row_cond, &touched).await {
            self.core.compensate(ctx, &[data_key.to_string()]).await;
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
        incr_value: Option<i64>,
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
        if let (Some(id), Some(idx)) = (incr_value, self.core.plan.increment_field) {
            record.set(idx, &FieldValue::Int(id))?;
        }
        Ok(Some(record))
    }
}
