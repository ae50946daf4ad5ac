//! 查询条件构造器
//!
//! 条件按加入顺序保存，默认用AND连接；`or()`把最近一个条件和下一个条件的
//! 连接符改为OR。缓存key按字段名排序后的条件值生成，保证同一查询的key稳定。

use crate::types::FieldValue;

/// 条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    /// 等于
    Eq,
    /// 不等于
    Ne,
    /// 大于
    Gt,
    /// 大于等于
    Ge,
    /// 小于
    Lt,
    /// 小于等于
    Le,
    /// 在列表中
    In,
}

impl CondOp {
    /// SQL片段
    pub fn sql(&self) -> &'static str {
        match self {
            CondOp::Eq => "=",
            CondOp::Ne => "!=",
            CondOp::Gt => ">",
            CondOp::Ge => ">=",
            CondOp::Lt => "<",
            CondOp::Le => "<=",
            CondOp::In => "IN",
        }
    }
}

/// 条件之间的连接符，记录在前一个条件上
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondLink {
    And,
    Or,
}

impl CondLink {
    fn sql(&self) -> &'static str {
        match self {
            CondLink::And => " AND ",
            CondLink::Or => " OR ",
        }
    }
}

/// 单个条件项
#[derive(Debug, Clone)]
pub struct CondItem {
    /// 字段tag名
    pub field: String,
    /// 操作符
    pub op: CondOp,
    /// 条件值，In操作符对应List
    pub value: FieldValue,
    /// 和下一个条件的连接符
    pub link: CondLink,
}

/// 条件集合
#[derive(Debug, Clone, Default)]
pub struct Conds {
    items: Vec<CondItem>,
}

impl Conds {
    /// 创建空条件集合
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, field: &str, op: CondOp, value: FieldValue) -> Self {
        self.items.push(CondItem {
            field: field.to_string(),
            op,
            value,
            link: CondLink::And,
        });
        self
    }

    /// 等于
    pub fn eq<V: Into<FieldValue>>(self, field: &str, value: V) -> Self {
        self.push(field, CondOp::Eq, value.into())
    }

    /// 不等于
    pub fn ne<V: Into<FieldValue>>(self, field: &str, value: V) -> Self {
        self.push(field, CondOp::Ne, value.into())
    }

    /// 大于
    pub fn gt<V: Into<FieldValue>>(self, field: &str, value: V) -> Self {
        self.push(field, CondOp::Gt, value.into())
    }

    /// 大于等于
    pub fn ge<V: Into<FieldValue>>(self, field: &str, value: V) -> Self {
        self.push(field, CondOp::Ge, value.into())
    }

    /// 小于
    pub fn lt<V: Into<FieldValue>>(self, field: &str, value: V) -> Self {
        self.push(field, CondOp::Lt, value.into())
    }

    /// 小于等于
    pub fn le<V: Into<FieldValue>>(self, field: &str, value: V) -> Self {
        self.push(field, CondOp::Le, value.into())
    }

    /// 在列表中
    pub fn in_list<V: Into<FieldValue>>(self, field: &str, values: Vec<V>) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        self.push(field, CondOp::In, FieldValue::List(list))
    }

    /// 把最近一个条件与下一个条件的连接符改为OR
    pub fn or(mut self) -> Self {
        if let Some(last) = self.items.last_mut() {
            last.link = CondLink::Or;
        }
        self
    }

    /// 查找字段对应的条件项
    pub fn find(&self, field: &str) -> Option<&CondItem> {
        self.items.iter().find(|c| c.field == field)
    }

    /// 条件项列表
    pub fn items(&self) -> &[CondItem] {
        &self.items
    }

    /// 条件数量
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 按字段名排序的副本，用于生成稳定的缓存key
    pub fn sorted(&self) -> Conds {
        let mut items = self.items.clone();
        items.sort_by(|a, b| a.field.cmp(&b.field));
        Conds { items }
    }

    /// 渲染WHERE片段，占位符用`?`，参数按顺序追加到args
    pub fn write_sql(&self, sql: &mut String, args: &mut Vec<FieldValue>) {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                sql.push_str(self.items[i - 1].link.sql());
            }
            sql.push_str(&item.field);
            match item.op {
                CondOp::In => {
                    sql.push_str(" IN (");
                    let values: &[FieldValue] = match &item.value {
                        FieldValue::List(list) => list,
                        single => std::slice::from_ref(single),
                    };
                    for (j, v) in values.iter().enumerate() {
                        if j > 0 {
                            sql.push(',');
                        }
                        sql.push('?');
                        args.push(v.clone());
                    }
                    sql.push(')');
                }
                op => {
                    sql.push_str(op.sql());
                    sql.push('?');
                    args.push(item.value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_sql_and_or() {
        let cond = Conds::new().eq("UID", 7i64).or().eq("Name", "a").gt("Age", 10i64);
        let mut sql = String::new();
        let mut args = Vec::new();
        cond.write_sql(&mut sql, &mut args);
        assert_eq!(sql, "UID=? OR Name=? AND Age>?");
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], FieldValue::Int(7));
    }

    #[test]
    fn test_write_sql_in() {
        let cond = Conds::new().in_list("Id", vec![1i64, 2, 3]);
        let mut sql = String::new();
        let mut args = Vec::new();
        cond.write_sql(&mut sql, &mut args);
        assert_eq!(sql, "Id IN (?,?,?)");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_sorted_stable() {
        let cond = Conds::new().eq("B", 1i64).eq("A", 2i64);
        let sorted = cond.sorted();
        assert_eq!(sorted.items()[0].field, "A");
        assert_eq!(sorted.items()[1].field, "B");
        // 原条件顺序不变
        assert_eq!(cond.items()[0].field, "B");
    }

    #[test]
    fn test_find() {
        let cond = Conds::new().eq("UID", 7i64);
        assert!(cond.find("UID").is_some());
        assert!(cond.find("uid").is_none());
    }
}
