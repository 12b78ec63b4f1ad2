//! 配置模式定义
//!
//! 模块在清单中声明自己的设置项，每个设置项由 [`SettingDefinition`] 描述：
//! 类型、默认值、数值范围、枚举选项以及可选的自定义校验函数。
//! `section` / `label` / `description` 只用于界面分组展示，不影响行为。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 设置项类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    /// 布尔值
    Boolean,
    /// 字符串
    String,
    /// 数值
    Number,
    /// 从枚举选项中选择
    Select,
    /// 颜色（`#rgb` / `#rrggbb` / `#rrggbbaa`）
    Color,
    /// 数组
    Array,
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingType::Boolean => "boolean",
            SettingType::String => "string",
            SettingType::Number => "number",
            SettingType::Select => "select",
            SettingType::Color => "color",
            SettingType::Array => "array",
        };
        f.write_str(name)
    }
}

/// 自定义校验函数
pub type SettingValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// 设置项定义
#[derive(Clone, Serialize, Deserialize)]
pub struct SettingDefinition {
    /// 值类型
    #[serde(rename = "type")]
    pub setting_type: SettingType,

    /// 默认值
    pub default: Value,

    /// 最小值（仅数值）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// 最大值（仅数值）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// 步长（仅用于界面展示）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    /// 允许的取值
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,

    /// 显示名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// 说明文字
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// 界面分组
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,

    /// 自定义校验函数
    #[serde(skip)]
    pub validator: Option<SettingValidator>,
}

impl fmt::Debug for SettingDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingDefinition")
            .field("setting_type", &self.setting_type)
            .field("default", &self.default)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("options", &self.options)
            .field("section", &self.section)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// 模块的设置模式：设置键 -> 定义
pub type SettingsSchema = BTreeMap<String, SettingDefinition>;

fn color_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^#([0-9a-fA-F]{3}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})$")
            .expect("颜色正则表达式是常量，必然有效")
    })
}

impl SettingDefinition {
    /// 创建指定类型的设置项
    pub fn new(setting_type: SettingType, default: Value) -> Self {
        Self {
            setting_type,
            default,
            min: None,
            max: None,
            step: None,
            options: None,
            label: None,
            description: None,
            section: None,
            validator: None,
        }
    }

    pub fn boolean(default: bool) -> Self {
        Self::new(SettingType::Boolean, Value::Bool(default))
    }

    pub fn string(default: impl Into<String>) -> Self {
        Self::new(SettingType::String, Value::String(default.into()))
    }

    pub fn number(default: f64) -> Self {
        Self::new(SettingType::Number, serde_json::json!(default))
    }

    pub fn select(default: impl Into<String>, options: &[&str]) -> Self {
        let mut def = Self::new(SettingType::Select, Value::String(default.into()));
        def.options = Some(options.iter().map(|o| Value::String(o.to_string())).collect());
        def
    }

    pub fn color(default: impl Into<String>) -> Self {
        Self::new(SettingType::Color, Value::String(default.into()))
    }

    pub fn array(default: Vec<Value>) -> Self {
        Self::new(SettingType::Array, Value::Array(default))
    }

    /// 设置数值范围
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// 设置步长
    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// 设置界面分组
    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// 设置显示名称
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 附加自定义校验函数
    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    /// 校验一个值
    ///
    /// 依次检查类型、数值范围、枚举成员和自定义校验函数，
    /// 返回第一个不满足的原因。
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match self.setting_type {
            SettingType::Boolean if !value.is_boolean() => {
                return Err(format!("期望 boolean，实际为 {}", value));
            }
            SettingType::String | SettingType::Select if !value.is_string() => {
                return Err(format!("期望 string，实际为 {}", value));
            }
            SettingType::Array if !value.is_array() => {
                return Err(format!("期望 array，实际为 {}", value));
            }
            SettingType::Color => {
                let valid = value.as_str().map_or(false, |s| color_pattern().is_match(s));
                if !valid {
                    return Err(format!("无效的颜色值: {}", value));
                }
            }
            SettingType::Number => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| format!("期望 number，实际为 {}", value))?;
                if let Some(min) = self.min {
                    if number < min {
                        return Err(format!("{} 小于最小值 {}", number, min));
                    }
                }
                if let Some(max) = self.max {
                    if number > max {
                        return Err(format!("{} 大于最大值 {}", number, max));
                    }
                }
            }
            _ => {}
        }

        if let Some(ref options) = self.options {
            if !options.contains(value) {
                return Err(format!("{} 不在允许的取值 {:?} 中", value, options));
            }
        }

        if let Some(ref validator) = self.validator {
            if !validator(value) {
                return Err("自定义校验未通过".to_string());
            }
        }

        Ok(())
    }
}

/// 从模式中提取默认值
pub fn defaults(schema: &SettingsSchema) -> Map<String, Value> {
    schema
        .iter()
        .map(|(key, def)| (key.clone(), def.default.clone()))
        .collect()
}
