//! IPC 消息信封

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 信封类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    /// 请求，需要响应
    Request,
    /// 响应
    Response,
    /// 点对点事件
    Event,
    /// 广播事件
    Broadcast,
}

/// IPC 消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// 消息类型
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    /// 动作或事件名称
    pub action: String,
    /// 负载
    #[serde(default)]
    pub data: Value,
    /// 请求 ID（请求与响应）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    /// 响应是否成功
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// 失败响应的错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 发送方实例 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 响应对应的请求方实例 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// 时间戳（毫秒）
    pub timestamp: i64,
}

impl Envelope {
    fn new(envelope_type: EnvelopeType, action: impl Into<String>, data: Value) -> Self {
        Self {
            envelope_type,
            action: action.into(),
            data,
            request_id: None,
            success: None,
            error: None,
            source: None,
            reply_to: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// 创建请求
    pub fn request(action: impl Into<String>, data: Value, request_id: u64) -> Self {
        let mut envelope = Self::new(EnvelopeType::Request, action, data);
        envelope.request_id = Some(request_id);
        envelope
    }

    /// 创建事件
    pub fn event(action: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeType::Event, action, data)
    }

    /// 创建广播
    pub fn broadcast(action: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeType::Broadcast, action, data)
    }

    /// 为请求创建成功响应
    pub fn success(request: &Envelope, data: Value) -> Self {
        let mut envelope = Self::new(EnvelopeType::Response, request.action.clone(), data);
        envelope.request_id = request.request_id;
        envelope.reply_to = request.source.clone();
        envelope.success = Some(true);
        envelope
    }

    /// 为请求创建失败响应
    pub fn failure(request: &Envelope, error: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeType::Response, request.action.clone(), Value::Null);
        envelope.request_id = request.request_id;
        envelope.reply_to = request.source.clone();
        envelope.success = Some(false);
        envelope.error = Some(error.into());
        envelope
    }

    /// 设置发送方
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_request(&self) -> bool {
        self.envelope_type == EnvelopeType::Request
    }

    pub fn is_response(&self) -> bool {
        self.envelope_type == EnvelopeType::Response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let request = Envelope::request("ping", json!({"n": 1}), 7).with_source("ctx-a");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "REQUEST");
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["source"], "ctx-a");
        assert!(value.get("success").is_none());

        let parsed: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_response_links_request() {
        let request = Envelope::request("getSettings", Value::Null, 3).with_source("ctx-a");

        let ok = Envelope::success(&request, json!(true));
        assert!(ok.is_response());
        assert_eq!(ok.request_id, Some(3));
        assert_eq!(ok.reply_to.as_deref(), Some("ctx-a"));
        assert_eq!(ok.success, Some(true));

        let failed = Envelope::failure(&request, "nope");
        assert_eq!(failed.success, Some(false));
        assert_eq!(failed.error.as_deref(), Some("nope"));
    }
}
