//! Lua脚本注册表
//!
//! 每个操作一段脚本，服务端原子执行，一次往返完成"续期+变更+读回"。
//! 脚本按SHA1缓存，NOSCRIPT时由客户端自动重新加载。
//!
//! 【注意】
//! lua层return nil或者直接return，客户端都识别为空值
//! 空值不要写入redis，redis会写成空字符串，自增类型的field后续HINCRBY会出错
//!
//! 返回值约定：
//! - nil   key不存在，需要回源重新加载
//! - 'OK'  变更已执行
//! - 'NULL' key存在但目标子项不存在，由调用方决定创建还是报错

use once_cell::sync::Lazy;
use redis::Script;

/// 自增key，hash结构，field使用table名
pub const INCREMENT_KEY: &str = "_mrcache_increment_";

// row /////////////////////////////////////////////////////////////////////////

/// row读取
/// ARGV: 有效期 field..
/// 返回：nil=key不存在  或 value.. 与field对应，不存在的field填nil
pub static ROW_GET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[1], ARGV[1])
if rst == 0 then
    return
end
return redis.call('HMGET', KEYS[1], select(2, unpack(ARGV)))
"#,
    )
});

/// row新增，直接保存
/// ARGV: 有效期 field value field value ..
/// 返回：OK
pub static ROW_ADD: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('HMSET', KEYS[1], select(2, unpack(ARGV)))
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 'OK'
"#,
    )
});

/// row设置，key不存在返回nil，不会盲建
/// ARGV: 有效期 field op value ..  op为set/del
/// 返回：nil=key不存在  OK=已执行
pub static ROW_SET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[1], ARGV[1])
if rst == 0 then
    return
end
local setkv = {}
local delk = {}
for i = 2, #ARGV, 3 do
    if ARGV[i+1] == "set" then
        setkv[#setkv+1] = ARGV[i]
        setkv[#setkv+1] = ARGV[i+2]
    elseif ARGV[i+1] == "del" then
        delk[#delk+1] = ARGV[i]
    end
end
if #setkv > 0 then
    redis.call('HMSET', KEYS[1], unpack(setkv))
end
if #delk > 0 then
    redis.call('HDEL', KEYS[1], unpack(delk))
end
return 'OK'
"#,
    )
});

/// row修改，key不存在返回nil
/// ARGV: 有效期 field op value ..  op为set/del/incr/fincr/get
/// 返回：nil=key不存在  或 变更后的value.. 与field对应
pub static ROW_MODIFY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[1], ARGV[1])
if rst == 0 then
    return
end
local fields = {}
local setkv = {}
for i = 2, #ARGV, 3 do
    fields[#fields+1] = ARGV[i]
    if ARGV[i+1] == "set" then
        setkv[#setkv+1] = ARGV[i]
        setkv[#setkv+1] = ARGV[i+2]
    elseif ARGV[i+1] == "del" then
        redis.call('HDEL', KEYS[1], ARGV[i])
    elseif ARGV[i+1] == "incr" then
        redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i+2])
    elseif ARGV[i+1] == "fincr" then
        redis.call('HINCRBYFLOAT', KEYS[1], ARGV[i], ARGV[i+2])
    end
end
if #setkv > 0 then
    redis.call('HMSET', KEYS[1], unpack(setkv))
end
-- 返回最新的值
return redis.call('HMGET', KEYS[1], unpack(fields))
"#,
    )
});

// rows ////////////////////////////////////////////////////////////////////////

/// rows全量读取，KEYS[1]为索引key
/// ARGV: 有效期 field..
/// 返回：nil=索引不存在或数据不一致  或 {value..} {value..} ..
pub static ROWS_GET_ALL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
-- 先判断索引key是否存在
local rst = redis.call('EXPIRE', KEYS[1], ARGV[1])
if rst == 0 then
    return
end
local datakeys = redis.call('HVALS', KEYS[1])
local resp = {}
for i = 1, #datakeys do
    local rst = redis.call('EXPIRE', datakeys[i], ARGV[1])
    if rst == 0 then
        return -- 数据不一致了 返回空 重新读
    end
    resp[i] = redis.call('HMGET', datakeys[i], select(2, unpack(ARGV)))
end
return resp
"#,
    )
});

/// rows单条读取，KEYS[1]为索引key，通过索引找到数据key
/// ARGV: 有效期 数据key值 field..
/// 返回：nil=索引不存在或数据不一致  'NULL'=索引中没有该数据key  或 value..
pub static ROWS_GET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[1], ARGV[1])
if rst == 0 then
    return
end
local datakey = redis.call('HGET', KEYS[1], ARGV[2])
if not datakey then
    return 'NULL'
end
rst = redis.call('EXPIRE', datakey, ARGV[1])
if rst == 0 then
    return -- 数据不一致了 返回空 重新读
end
return redis.call('HMGET', datakey, select(3, unpack(ARGV)))
"#,
    )
});

/// rows批量读取，KEYS[1]为索引key
/// ARGV: 有效期 n 数据key值1..n field..
/// 返回：nil=索引不存在或数据不一致  或 {value..}.. 索引中不存在的数据key跳过
pub static ROWS_GETS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[1], ARGV[1])
if rst == 0 then
    return
end
local n = tonumber(ARGV[2])
local resp = {}
for i = 1, n do
    local datakey = redis.call('HGET', KEYS[1], ARGV[2+i])
    if datakey then
        rst = redis.call('EXPIRE', datakey, ARGV[1])
        if rst == 0 then
            return -- 数据不一致了 返回空 重新读
        end
        resp[#resp+1] = redis.call('HMGET', datakey, select(n+3, unpack(ARGV)))
    end
end
return resp
"#,
    )
});

/// rows新增，KEYS[1]为索引key，其余为数据key
/// ARGV: 有效期 num(后面field value的个数) field value ..  num field value ..
/// 返回：OK
pub static ROWS_ADD: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local kvpos = 2
for i = 1, #KEYS do
    local kvnum = tonumber(ARGV[kvpos])
    kvpos = kvpos + 1
    if kvnum > 0 then
        local kv = {}
        for j = 1, kvnum do
            kv[#kv+1] = ARGV[kvpos]
            kvpos = kvpos + 1
        end
        redis.call('HMSET', KEYS[i], unpack(kv))
        redis.call('EXPIRE', KEYS[i], ARGV[1])
    end
end
return 'OK'
"#,
    )
});

/// rows设置，KEYS[1]为索引key，KEYS[2]为数据key
/// ARGV: 有效期 field op value ..  op为set/del
/// 返回：nil=数据key不存在  OK=已执行
pub static ROWS_SET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[2], ARGV[1])
if rst == 0 then
    return
end
local setkv = {}
local delk = {}
for i = 2, #ARGV, 3 do
    if ARGV[i+1] == "set" then
        setkv[#setkv+1] = ARGV[i]
        setkv[#setkv+1] = ARGV[i+2]
    elseif ARGV[i+1] == "del" then
        delk[#delk+1] = ARGV[i]
    end
end
if #setkv > 0 then
    redis.call('HMSET', KEYS[2], unpack(setkv))
end
if #delk > 0 then
    redis.call('HDEL', KEYS[2], unpack(delk))
end
-- 索引key一起续期
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 'OK'
"#,
    )
});

/// rows修改，KEYS[1]为索引key，KEYS[2]为数据key
/// ARGV: 有效期 field op value ..  op为set/del/incr/fincr/get
/// 返回：nil=数据key不存在  或 变更后的value.. 与field对应
pub static ROWS_MODIFY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local rst = redis.call('EXPIRE', KEYS[2], ARGV[1])
if rst == 0 then
    return
end
local fields = {}
local setkv = {}
for i = 2, #ARGV, 3 do
    fields[#fields+1] = ARGV[i]
    if ARGV[i+1] == "set" then
        setkv[#setkv+1] = ARGV[i]
        setkv[#setkv+1] = ARGV[i+2]
    elseif ARGV[i+1] == "del" then
        redis.call('HDEL', KEYS[2], ARGV[i])
    elseif ARGV[i+1] == "incr" then
        redis.call('HINCRBY', KEYS[2], ARGV[i], ARGV[i+2])
    elseif ARGV[i+1] == "fincr" then
        redis.call('HINCRBYFLOAT', KEYS[2], ARGV[i], ARGV[i+2])
    end
end
if #setkv > 0 then
    redis.call('HMSET', KEYS[2], unpack(setkv))
end
-- 索引key一起续期
redis.call('EXPIRE', KEYS[1], ARGV[1])
-- 返回最新的值
return redis.call('HMGET', KEYS[2], unpack(fields))
"#,
    )
});

/// rows删除单条，KEYS[1]为索引key，KEYS[2]为数据key
/// ARGV: 有效期 数据key值
/// 返回：OK
pub static ROWS_DEL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('HDEL', KEYS[1], ARGV[2])
redis.call('DEL', KEYS[2])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 'OK'
"#,
    )
});

/// rows全量删除，KEYS[1]为索引key
/// 返回：OK
pub static ROWS_DEL_ALL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local datakeys = redis.call('HVALS', KEYS[1])
for i = 1, #datakeys do
    redis.call('DEL', datakeys[i])
end
redis.call('DEL', KEYS[1])
return 'OK'
"#,
    )
});

// column //////////////////////////////////////////////////////////////////////

/// column全量读取，主key（自增字段所在key）不存在说明数据为空
/// ARGV: 有效期 主key位置(lua下标)
/// 返回：nil=数据为空  或 {field value ..}.. 与KEYS对应，field为自增字段值
pub static COLUMN_GET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
-- 先判断主key是否存在
local rst = redis.call('EXPIRE', KEYS[ARGV[2]], ARGV[1])
if rst == 0 then
    return
end
local resp = {}
for i = 1, #KEYS do
    resp[i] = {}
    local rst = 1
    if i ~= tonumber(ARGV[2]) then
        rst = redis.call('EXPIRE', KEYS[i], ARGV[1])
    end
    if rst ~= 0 then
        resp[i] = redis.call('HGETALL', KEYS[i])
    end
end
return resp
"#,
    )
});

/// column单条读取
/// ARGV: 有效期 主key位置(lua下标) 自增id
/// 返回：nil=数据为空  {"NULL"}=没有该自增id  或 {"OK"} {value..} 与KEYS对应
pub static COLUMN_GET_ONE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
-- 先判断主key是否存在
local rst = redis.call('EXPIRE', KEYS[ARGV[2]], ARGV[1])
if rst == 0 then
    return
end
-- 其他key一块续期
for i = 1, #KEYS do
    if i ~= tonumber(ARGV[2]) then
        redis.call('EXPIRE', KEYS[i], ARGV[1])
    end
end
local resp = {}
-- 判断自增id是否存在
local rst = redis.call('HEXISTS', KEYS[tonumber(ARGV[2])], ARGV[3])
if tonumber(rst) == 0 then
    resp[1] = {"NULL"}
    return resp
end
resp[1] = {"OK"}
resp[2] = {}
for i = 1, #KEYS do
    resp[2][i] = redis.call('HGET', KEYS[i], ARGV[3])
end
return resp
"#,
    )
});

/// column新增，直接保存
/// ARGV: 有效期 num(后面field value的个数) field value ..  num field value ..
/// 返回：OK
pub static COLUMN_ADD: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local kvpos = 2
for i = 1, #KEYS do
    local kvnum = tonumber(ARGV[kvpos])
    kvpos = kvpos + 1
    if kvnum > 0 then
        local kv = {}
        for j = 1, kvnum do
            kv[#kv+1] = ARGV[kvpos]
            kvpos = kvpos + 1
        end
        redis.call('HMSET', KEYS[i], unpack(kv))
        redis.call('EXPIRE', KEYS[i], ARGV[1])
    end
end
return 'OK'
"#,
    )
});

/// column设置，主key不存在返回nil
/// ARGV: 有效期 主key位置(lua下标) 自增id (每个key对应一组)op value ..
/// 返回：nil=数据为空  NULL=没有该自增id  OK=已执行
pub static COLUMN_SET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
for i = 1, #KEYS do
    local rst = redis.call('EXPIRE', KEYS[i], ARGV[1])
    if i == tonumber(ARGV[2]) and rst == 0 then
        return -- 主key不存在 就是空数据，过期要一块设置
    end
end
-- 判断自增id是否存在
local rst = redis.call('HEXISTS', KEYS[tonumber(ARGV[2])], ARGV[3])
if tonumber(rst) == 0 then
    return 'NULL'
end
local kvpos = 4
for i = 1, #KEYS do
    if ARGV[kvpos] == "set" then
        redis.call('HSET', KEYS[i], ARGV[3], ARGV[kvpos+1])
    end
    kvpos = kvpos + 2
end
return 'OK'
"#,
    )
});

/// column修改单条，每个key只动自增id对应的一个field
/// ARGV: 有效期 主key位置(lua下标) 自增id (每个key对应一组)op value ..
/// 返回：nil=数据为空  {"NULL"}=没有该自增id  或 {"OK"} {value..} 与KEYS对应
pub static COLUMN_MODIFY_ONE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
for i = 1, #KEYS do
    local rst = redis.call('EXPIRE', KEYS[i], ARGV[1])
    if i == tonumber(ARGV[2]) and rst == 0 then
        return -- 主key不存在 就是空数据，过期要一块设置
    end
end
local resp = {}
-- 判断自增id是否存在
local rst = redis.call('HEXISTS', KEYS[tonumber(ARGV[2])], ARGV[3])
if tonumber(rst) == 0 then
    resp[1] = {"NULL"}
    return resp
end
resp[1] = {"OK"}
resp[2] = {}
local kvpos = 4
for i = 1, #KEYS do
    if ARGV[kvpos] == "set" then
        redis.call('HSET', KEYS[i], ARGV[3], ARGV[kvpos+1])
        resp[2][i] = ARGV[kvpos+1]
    elseif ARGV[kvpos] == "incr" then
        resp[2][i] = redis.call('HINCRBY', KEYS[i], ARGV[3], ARGV[kvpos+1])
    elseif ARGV[kvpos] == "fincr" then
        resp[2][i] = redis.call('HINCRBYFLOAT', KEYS[i], ARGV[3], ARGV[kvpos+1])
    else
        resp[2][i] = redis.call('HGET', KEYS[i], ARGV[3])
    end
    kvpos = kvpos + 2
end
return resp
"#,
    )
});

// incr ////////////////////////////////////////////////////////////////////////

/// 自增id分配，支持分片
/// KEYS[1]为自增hash  ARGV: field 分片总数 分片序号
/// 分片总数为0时直接加1；否则按分片总数步进并对齐到分片序号，
/// 各分片产生互不相交的等差数列，且整体严格递增
pub static INCR: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local cnt = tonumber(ARGV[2])
if cnt == 0 then
    return redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
end
local v = redis.call('HINCRBY', KEYS[1], ARGV[1], cnt)
local delta = (tonumber(ARGV[3]) - v) % cnt
if delta ~= 0 then
    v = redis.call('HINCRBY', KEYS[1], ARGV[1], delta)
end
return v
"#,
    )
});
