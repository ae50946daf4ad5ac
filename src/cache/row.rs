//! 单行缓存
//!
//! 查询条件只对应一行数据，Redis用一个hash缓存这一行，hash的field和
//! MySQL列对应，空值不写入。写路径先过Lua脚本再同步MySQL，MySQL失败
//! 删掉缓存key，由下一次读取从MySQL重建。

use std::marker::PhantomData;

use crate::cache::{
    reply_as_bulk, reply_is_nil, CacheCore, DataMap, ScriptArgs,
};
use crate::error::{MrCacheError, MrResult};
use crate::keys::{self, CacheShape};
use crate::mysql_adapter::MysqlAdapter;
use crate::redis_driver::pass::{del_pass, get_pass, set_pass};
use crate::redis_driver::RedisDriver;
use crate::schema::TableRecord;
use crate::script;
use crate::types::{CallContext, CondOp, Conds, FieldValue};

/// 预加载结果
enum Preload<T> {
    /// 本调用完成了加载
    Loaded(T),
    /// 本调用完成了加载，MySQL无数据
    Empty,
    /// 别的调用在加载，等它释放后重读缓存即可
    Waited,
}

/// 单行缓存，T为数据库行结构，可跨任务共享
pub struct CacheRow<T: TableRecord> {
    core: CacheCore,
    _marker: PhantomData<T>,
}

impl<T: TableRecord> CacheRow<T> {
    /// 创建单行缓存，默认把结构第一个字段当自增字段
    pub fn new(redis: RedisDriver, mysql: MysqlAdapter, table: &str) -> Self {
        Self {
            core: CacheCore::new::<T>(redis, mysql, table),
            _marker: PhantomData,
        }
    }

    /// 配置hashtag字段，条件中该字段的值会包上{}让Cluster同slot
    pub fn config_hash_tag(&mut self, field: &str) -> MrResult<()> {
        self.core.plan.config_hash_tag(field)
    }

    /// 配置自增字段和自增表名（拆表时多个表共用一个自增表名）
    pub fn config_increment(&mut self, field: &str, increment_table: &str) -> MrResult<()> {
        self.core.plan.config_increment(field, increment_table)
    }

    /// 配置过期时间（秒）
    pub fn config_expire(&mut self, expire_secs: i64) -> MrResult<()> {
        self.core.plan.config_expire(expire_secs)
    }

    /// 配置自增分片，各分片产生互不相交的id序列
    pub fn config_shard(&mut self, shard_count: u32, shard_index: u32) -> MrResult<()> {
        self.core.plan.config_shard(shard_count, shard_index)
    }

    /// 配置附加查询条件，所有SELECT都会带上
    pub fn config_query_cond(&mut self, cond: Conds) -> MrResult<()> {
        self.core.plan.config_query_cond(cond)
    }

    /// 配置单条件字段，之后可以用*_oc系列函数
    pub fn config_one_cond_field(&mut self, field: &str) -> MrResult<()> {
        self.core.plan.config_one_cond_field(field)
    }

    // 读 ///////////////////////////////////////////////////////////////////

    /// 读取一行，MySQL确认无数据时返回None
    pub async fn get(&self, ctx: &CallContext, cond: &Conds) -> MrResult<Option<T>> {
        match self.get_inner(ctx, cond).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.core.log_error(ctx, "Get", &e);
                Err(e)
            }
        }
    }

    /// 单条件版Get，需要先配置one_cond_field
    pub async fn get_oc<V: Into<FieldValue>>(
        &self,
        ctx: &CallContext,
        cond_value: V,
    ) -> MrResult<Option<T>> {
        let cond = self.core.plan.one_cond(cond_value)?;
        self.get(ctx, &cond).await
    }

    async fn get_inner(&self, ctx: &CallContext, cond: &Conds) -> MrResult<Option<T>> {
        let key = self.core.plan.plan_key(CacheShape::Row, cond, false)?;

        if let Some(record) = self.redis_get(ctx, &key).await? {
            return Ok(Some(record));
        }
        // 未命中，空结果备忘直接短路
        if get_pass(&key) {
            return Ok(None);
        }
        match self.pre_load(ctx, cond, &key).await? {
            Preload::Loaded(record) => Ok(Some(record)),
            Preload::Empty => {
                set_pass(&key);
                Ok(None)
            }
            // 别人加载的，重读一次
            Preload::Waited => self.redis_get(ctx, &key).await,
        }
    }

    // 写 ///////////////////////////////////////////////////////////////////

    /// 直接插入一行并返回自增id，不走缓存优先路径
    pub async fn add(&self, ctx: &CallContext, cond: &Conds, data: &DataMap) -> MrResult<(Option<T>, i64)> {
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
        let key = self.core.plan.plan_key(CacheShape::Row, cond, false)?;
        let pairs = self.core.plan.check_data(data)?;
        let incr_value = self.core.add_to_mysql(ctx, cond, &pairs).await?;
        del_pass(&key);
        // 旧缓存作废，下次读取重建
        self.core.redis.del_keys(ctx, &[key]).await?;
        if ctx.no_resp {
            return Ok((None, incr_value));
        }
        // 刚插入的数据直接回读MySQL
        let record: T = self.core.get_from_mysql(cond).await?;
        Ok((Some(record), incr_value))
    }

    /// 覆盖写若干字段
    ///
    /// 数据map中的自增字段和条件字段会被忽略。行不存在且选项里带
    /// create_on_miss时先创建，返回新行自增id；不创建则返回NullData错误
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
        let key = self.core.plan.plan_key(CacheShape::Row, cond, false)?;
        let pairs = self.core.plan.check_data(data)?;
        let ops = self.core.plan.set_ops(cond, &pairs, &[]);
        let args = self.core.plan.ops_args(&ops);

        match self.redis_set_to_mysql(ctx, cond, &key, &args, &pairs).await {
            Ok(()) => return Ok((self.post_image(ctx, cond, &pairs, None)?, None)),
            Err(MrCacheError::NullData) => {}
            Err(e) => return Err(e),
        }

        // 缓存没有这行，预加载（必要时创建）
        let incr_value = self.pre_load_write(ctx, cond, &key).await?;

        // 再次写数据
        self.redis_set_to_mysql(ctx, cond, &key, &args, &pairs).await?;
        Ok((self.post_image(ctx, cond, &pairs, incr_value)?, incr_value))
    }

    /// 增量修改若干字段并返回修改后的值
    ///
    /// 整数字段按增量累加、浮点字段按增量累加、其他类型覆盖写；
    /// 自增字段和条件字段只读回不修改。修改在Lua脚本里一次完成，
    /// 调用方看到的是一个原子变更
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
        let key = self.core.plan.plan_key(CacheShape::Row, cond, false)?;
        let pairs = self.core.plan.check_data(data)?;
        let ops = self.core.plan.modify_ops(cond, &pairs, &[]);
        let args = self.core.plan.ops_args(&ops);
        let field_idxs: Vec<usize> = ops.iter().map(|o| o.idx).collect();

        match self
            .redis_modify_to_mysql(ctx, cond, &key, &args, &field_idxs)
            .await
        {
            Ok(record) => {
                return Ok((if ctx.no_resp { None } else { Some(record) }, None));
            }
            Err(MrCacheError::NullData) => {}
            Err(e) => return Err(e),
        }

        let incr_value = self.pre_load_write(ctx, cond, &key).await?;

        // 再次写数据
        let record = self
            .redis_modify_to_mysql(ctx, cond, &key, &args, &field_idxs)
            .await?;
        Ok((if ctx.no_resp { None } else { Some(record) }, incr_value))
    }

    // 删 ///////////////////////////////////////////////////////////////////

    /// 删除缓存和MySQL中的行
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
        let key = self.core.plan.plan_key(CacheShape::Row, cond, false)?;
        self.core.redis.del_keys(ctx, &[key.clone()]).await?;
        self.core.mysql.delete(&self.core.plan.table, cond).await?;
        del_pass(&key);
        Ok(())
    }

    /// 只删缓存，MySQL不动
    pub async fn del_cache(&self, ctx: &CallContext, cond: &Conds) -> MrResult<()> {
        let key = self.core.plan.plan_key(CacheShape::Row, cond, false)?;
        let result = self.core.redis.del_keys(ctx, &[key]).await;
        if let Err(e) = &result {
            self.core.log_error(ctx, "DelCache", e);
        }
        result
    }

    // 内部 /////////////////////////////////////////////////////////////////

    async fn redis_get(&self, ctx: &CallContext, key: &str) -> MrResult<Option<T>> {
        let args = self.core.plan.tag_args();
        let script_keys = [key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(ctx, "rowGet", &script::ROW_GET, &script_keys, args.as_slice())
            .await?;
        if reply_is_nil(&reply) {
            return Ok(None);
        }
        let items = reply_as_bulk(reply)?;
        let mut record = T::default();
        let idxs: Vec<usize> = (0..self.core.plan.layout.len()).collect();
        match self.core.plan.bind_reply_values(&items, &idxs, &mut record) {
            Ok(()) => Ok(Some(record)),
            Err(e) => {
                // 缓存内容和结构对不上，删掉重建
                self.core.compensate(ctx, &script_keys).await;
                Err(e)
            }
        }
    }

    /// 读路径预加载：抢到锁就回源并写缓存，抢不到等别人完成
    async fn pre_load(&self, ctx: &CallContext, cond: &Conds, key: &str) -> MrResult<Preload<T>> {
        let lock_key = keys::lock_key(key);
        match self
            .core
            .locks
            .try_lock_wait(&self.core.redis, &lock_key)
            .await?
        {
            Some(guard) => {
                let result = self.load_to_redis(ctx, cond, key).await;
                self.core.locks.release(guard).await;
                match result {
                    Ok(record) => Ok(Preload::Loaded(record)),
                    Err(MrCacheError::NullData) => Ok(Preload::Empty),
                    Err(e) => Err(e),
                }
            }
            None => Ok(Preload::Waited),
        }
    }

    /// 写路径预加载：create_on_miss时独占锁，确认不存在就插入
    async fn pre_load_write(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
    ) -> MrResult<Option<i64>> {
        let lock_key = keys::lock_key(key);
        if ctx.create_on_miss {
            let guard = self.core.locks.lock(&self.core.redis, &lock_key).await?;
            let result = self.load_or_create(ctx, cond, key).await;
            self.core.locks.release(guard).await;
            result
        } else {
            match self.pre_load(ctx, cond, key).await? {
                Preload::Loaded(_) | Preload::Waited => Ok(None),
                // 不创建就是真没有
                Preload::Empty => Err(MrCacheError::NullData),
            }
        }
    }

    async fn load_or_create(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
    ) -> MrResult<Option<i64>> {
        match self.load_to_redis(ctx, cond, key).await {
            Ok(_) => Ok(None),
            Err(MrCacheError::NullData) => {
                // 创建一行：条件字段+默认值，字段内容由后续的写补上
                let incr_value = self.core.add_to_mysql(ctx, cond, &[]).await?;
                del_pass(key);
                self.load_to_redis(ctx, cond, key).await?;
                Ok(Some(incr_value))
            }
            Err(e) => Err(e),
        }
    }

    /// MySQL读一行并写入Redis
    async fn load_to_redis(&self, ctx: &CallContext, cond: &Conds, key: &str) -> MrResult<T> {
        let record: T = self.core.get_from_mysql(cond).await?;
        let pairs = self.core.plan.record_kv_pairs(&record);
        let mut args = ScriptArgs::new();
        args.push_i64(self.core.plan.expire);
        for (idx, value) in &pairs {
            args.push_str(self.core.plan.layout.field(*idx).name);
            args.push_value(value);
        }
        let script_keys = [key.to_string()];
        if let Err(e) = self
            .core
            .redis
            .run_script(ctx, "rowAdd", &script::ROW_ADD, &script_keys, args.as_slice())
            .await
        {
            self.core.compensate(ctx, &script_keys).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Lua写缓存成功后同步MySQL，MySQL失败删缓存
    async fn redis_set_to_mysql(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
        args: &ScriptArgs,
        pairs: &[(usize, FieldValue)],
    ) -> MrResult<()> {
        let script_keys = [key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(ctx, "rowSet", &script::ROW_SET, &script_keys, args.as_slice())
            .await?;
        if reply_is_nil(&reply) {
            return Err(MrCacheError::NullData);
        }
        if let Err(e) = self.core.save_to_mysql(cond, pairs).await {
            self.core.compensate(ctx, &script_keys).await;
            return Err(e);
        }
        Ok(())
    }

    /// Lua修改并读回最新值，同步MySQL；绑定失败或MySQL失败都删缓存
    async fn redis_modify_to_mysql(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        key: &str,
        args: &ScriptArgs,
        field_idxs: &[usize],
    ) -> MrResult<T> {
        let script_keys = [key.to_string()];
        let reply = self
            .core
            .redis
            .run_script(
                ctx,
                "rowModify",
                &script::ROW_MODIFY,
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
            // 绑定失败说明缓存内容和MySQL对不上了，删key
            self.core.compensate(ctx, &script_keys).await;
            return Err(e);
        }
        let touched: Vec<(usize, FieldValue)> =
            field_idxs.iter().map(|i| (*i, record.get(*i))).collect();
        if let Err(e) = self.core.save_to_mysql(cond, &touched).await {
            self.core.compensate(ctx, &script_keys).await;
            return Err(e);
        }
        Ok(record)
    }

    /// Set的返回镜像：条件值+写入值+自增id拼出来的行
    fn post_image(
        &self,
        ctx: &CallContext,
        cond: &Conds,
        pairs: &[(usize, FieldValue)],
        incr_value: Option<i64>,
    ) -> MrResult<Option<T>> {
        if ctx.no_resp {
            return Ok(None);
        }
        let mut record = T::default();
        for item in cond.items() {
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
