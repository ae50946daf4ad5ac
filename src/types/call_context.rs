//! 调用选项
//!
//! 每次操作携带的请求级选项集合，是一个封闭集：不需要返回值、不存在时创建、
//! 屏蔽普通日志，以及用于日志关联的调用方/链路信息。

/// 请求级调用选项
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// 不需要返回修改后的数据，调用方丢弃结果时可省一次组装
    pub no_resp: bool,
    /// 数据不存在时创建（Set/Modify路径）
    pub create_on_miss: bool,
    /// 屏蔽非错误日志
    pub no_log: bool,
    /// 调用方位置描述，用于问题定位
    pub caller: Option<String>,
    /// 链路追踪ID
    pub trace_id: Option<String>,
    /// 消息ID
    pub msg_id: Option<String>,
}

impl CallContext {
    /// 创建默认选项
    pub fn new() -> Self {
        Self::default()
    }

    /// 不需要返回值
    pub fn no_resp(mut self) -> Self {
        self.no_resp = true;
        self
    }

    /// 不存在时创建
    pub fn create_on_miss(mut self) -> Self {
        self.create_on_miss = true;
        self
    }

    /// 屏蔽非错误日志
    pub fn no_log(mut self) -> Self {
        self.no_log = true;
        self
    }

    /// 记录调用方位置
    pub fn caller(mut self, caller: &str) -> Self {
        self.caller = Some(caller.to_string());
        self
    }

    /// 记录链路追踪ID
    pub fn trace_id(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    /// 记录消息ID
    pub fn msg_id(mut self, msg_id: &str) -> Self {
        self.msg_id = Some(msg_id.to_string());
        self
    }

    /// 日志后缀，拼接调用方和链路信息
    pub(crate) fn log_tag(&self) -> String {
        let mut tag = String::new();
        if let Some(caller) = &self.caller {
            tag.push_str(" caller=");
            tag.push_str(caller);
        }
        if let Some(trace_id) = &self.trace_id {
            tag.push_str(" trace=");
            tag.push_str(trace_id);
        }
        if let Some(msg_id) = &self.msg_id {
            tag.push_str(" msg=");
            tag.push_str(msg_id);
        }
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_flags() {
        let ctx = CallContext::new().no_resp().create_on_miss();
        assert!(ctx.no_resp);
        assert!(ctx.create_on_miss);
        assert!(!ctx.no_log);
    }

    #[test]
    fn test_log_tag() {
        let ctx = CallContext::new().caller("svc/user.rs:42").trace_id("t-1");
        let tag = ctx.log_tag();
        assert!(tag.contains("caller=svc/user.rs:42"));
        assert!(tag.contains("trace=t-1"));
    }
}
