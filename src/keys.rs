//! 缓存key规划
//!
//! key格式：`前缀_表名[_字段名]_条件值1_条件值2..`，条件值按字段名排序后
//! 拼接，同一查询条件生成的key恒定。命中hashtag字段的条件值会包上`{}`，
//! Redis Cluster会把同一查询产生的所有key分配到同一slot。

use crate::schema::FieldLayout;
use crate::types::Conds;

/// 缓存形态，决定key前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheShape {
    /// 单行缓存
    Row,
    /// 多行缓存（索引key + 数据key）
    Rows,
    /// 列式缓存（每列一个key）
    Column,
}

impl CacheShape {
    /// key前缀
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheShape::Row => "mrr",
            CacheShape::Rows => "mrrs",
            CacheShape::Column => "mrc",
        }
    }
}

fn push_cond_value(key: &mut String, field: &str, value_text: &str, hash_tag_field: Option<&str>) {
    if hash_tag_field == Some(field) {
        key.push_str("_{");
        key.push_str(value_text);
        key.push('}');
    } else {
        key.push('_');
        key.push_str(value_text);
    }
}

/// 生成row/rows形态的缓存key
pub fn build_key(
    shape: CacheShape,
    table: &str,
    cond: &Conds,
    hash_tag_field: Option<&str>,
) -> String {
    let mut key = String::with_capacity(table.len() + 16);
    key.push_str(shape.prefix());
    key.push('_');
    key.push_str(table);

    // 只有一个条件时不用排序
    if cond.len() == 1 {
        let item = &cond.items()[0];
        push_cond_value(&mut key, &item.field, &item.value.to_string(), hash_tag_field);
        return key;
    }

    let sorted = cond.sorted();
    for item in sorted.items() {
        push_cond_value(&mut key, &item.field, &item.value.to_string(), hash_tag_field);
    }
    key
}

/// 生成column形态的key列表，和布局字段一一对应
pub fn build_column_keys(
    table: &str,
    layout: &FieldLayout,
    cond: &Conds,
    hash_tag_field: Option<&str>,
) -> Vec<String> {
    let sorted = cond.sorted();
    let mut keys = Vec::with_capacity(layout.len());
    for def in layout.fields() {
        let mut key = String::with_capacity(table.len() + def.name.len() + 16);
        key.push_str(CacheShape::Column.prefix());
        key.push('_');
        key.push_str(table);
        key.push('_');
        key.push_str(def.name);
        for item in sorted.items() {
            push_cond_value(&mut key, &item.field, &item.value.to_string(), hash_tag_field);
        }
        keys.push(key);
    }
    keys
}

/// 数据key：索引key + "_" + 数据key字段的值
pub fn data_key(index_key: &str, data_key_value: &str) -> String {
    let mut key = String::with_capacity(index_key.len() + 1 + data_key_value.len());
    key.push_str(index_key);
    key.push('_');
    key.push_str(data_key_value);
    key
}

/// 预加载锁key
pub fn lock_key(cache_key: &str) -> String {
    format!("lock_{}", cache_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldLayout};
    use crate::types::{Conds, FieldType};

    #[test]
    fn test_single_cond_key() {
        let cond = Conds::new().eq("UID", 7i64);
        assert_eq!(build_key(CacheShape::Row, "users", &cond, None), "mrr_users_7");
        assert_eq!(
            build_key(CacheShape::Row, "users", &cond, Some("UID")),
            "mrr_users_{7}"
        );
        assert_eq!(
            build_key(CacheShape::Rows, "orders", &cond, Some("UID")),
            "mrrs_orders_{7}"
        );
    }

    #[test]
    fn test_multi_cond_sorted() {
        // 条件加入顺序不同，key相同
        let a = Conds::new().eq("UID", 7i64).eq("Group", 2i64);
        let b = Conds::new().eq("Group", 2i64).eq("UID", 7i64);
        let ka = build_key(CacheShape::Row, "users", &a, Some("UID"));
        let kb = build_key(CacheShape::Row, "users", &b, Some("UID"));
        assert_eq!(ka, kb);
        assert_eq!(ka, "mrr_users_2_{7}");
    }

    #[test]
    fn test_column_keys() {
        let layout = FieldLayout::new(&[
            FieldDef { name: "Id", ty: FieldType::Int, nullable: false },
            FieldDef { name: "Hits", ty: FieldType::Int, nullable: false },
        ]);
        let cond = Conds::new().eq("UID", 5i64);
        let keys = build_column_keys("counters", &layout, &cond, Some("UID"));
        assert_eq!(keys, vec!["mrc_counters_Id_{5}", "mrc_counters_Hits_{5}"]);
    }

    #[test]
    fn test_data_and_lock_key() {
        assert_eq!(data_key("mrrs_orders_{9}", "101"), "mrrs_orders_{9}_101");
        assert_eq!(lock_key("mrr_users_{7}"), "lock_mrr_users_{7}");
    }
}
