//! 模块清单
//!
//! 清单是模块的静态描述：身份、版本、依赖与冲突声明、设置模式。
//! 清单注册后不可变，替换清单需要先注销再注册。
//!
//! 清单（不含代码能力）可以从 YAML 或 JSON 解析：
//!
//! ```yaml
//! id: dark-mode
//! name: 深色模式
//! version: 1.2.0
//! dependencies: [theme-core]
//! conflicts: [high-contrast]
//! settings:
//!   brightness: { type: number, default: 80, min: 0, max: 100 }
//! ```

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{SettingDefinition, SettingsSchema};
use crate::utils::{CoreError, Result};

/// 模块清单
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    /// 模块唯一标识
    pub id: String,

    /// 显示名称
    pub name: String,

    /// 版本（`major.minor.patch` 开头）
    pub version: String,

    /// 描述
    #[serde(default)]
    pub description: String,

    /// 作者
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// 分类
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// 标签
    #[serde(default)]
    pub tags: Vec<String>,

    /// 必需依赖
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// 可选依赖（只影响加载顺序）
    #[serde(default)]
    pub optional_dependencies: Vec<String>,

    /// 冲突模块
    #[serde(default)]
    pub conflicts: Vec<String>,

    /// 设置模式
    #[serde(default)]
    pub settings: SettingsSchema,

    /// 要求的最低运行时版本（semver 版本要求）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_runtime_version: Option<String>,

    /// 自定义元数据
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^[a-z0-9\-_]+$").expect("模块 ID 正则表达式是常量，必然有效"))
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+").expect("版本正则表达式是常量，必然有效"))
}

impl ModuleManifest {
    /// 创建新的清单
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: None,
            category: None,
            tags: vec![],
            dependencies: vec![],
            optional_dependencies: vec![],
            conflicts: vec![],
            settings: SettingsSchema::new(),
            min_runtime_version: None,
            metadata: Map::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// 添加必需依赖
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// 添加可选依赖
    pub fn optionally_depends_on(mut self, id: impl Into<String>) -> Self {
        self.optional_dependencies.push(id.into());
        self
    }

    /// 添加冲突模块
    pub fn conflicts_with(mut self, id: impl Into<String>) -> Self {
        self.conflicts.push(id.into());
        self
    }

    /// 声明设置项
    pub fn setting(mut self, key: impl Into<String>, definition: SettingDefinition) -> Self {
        self.settings.insert(key.into(), definition);
        self
    }

    pub fn min_runtime_version(mut self, requirement: impl Into<String>) -> Self {
        self.min_runtime_version = Some(requirement.into());
        self
    }

    /// 所有声明的依赖（必需在前，可选在后）
    pub fn all_dependencies(&self) -> impl Iterator<Item = &String> {
        self.dependencies.iter().chain(self.optional_dependencies.iter())
    }

    /// 验证清单
    ///
    /// 检查必填字段、ID 与版本格式、运行时版本要求以及设置默认值。
    pub fn validate(&self) -> Result<()> {
        let mut errors = vec![];

        if self.id.is_empty() {
            errors.push("模块 ID 不能为空".to_string());
        } else if !id_pattern().is_match(&self.id) {
            errors.push(format!("模块 ID 只能包含字母、数字、'-' 和 '_': {}", self.id));
        }

        if self.name.trim().is_empty() {
            errors.push("模块名称不能为空".to_string());
        }

        if !version_pattern().is_match(&self.version) {
            errors.push(format!("无效的版本号格式: {}", self.version));
        }

        if let Some(ref requirement) = self.min_runtime_version {
            match VersionReq::parse(requirement) {
                Ok(req) => {
                    let runtime = Version::parse(crate::VERSION)?;
                    if !req.matches(&runtime) {
                        errors.push(format!(
                            "需要运行时版本 {}，当前为 {}",
                            requirement,
                            crate::VERSION
                        ));
                    }
                }
                Err(_) => errors.push(format!("运行时版本要求格式无效: {}", requirement)),
            }
        }

        if self.dependencies.iter().any(|d| d == &self.id) {
            errors.push("模块不能依赖自身".to_string());
        }

        for conflict in &self.conflicts {
            if self.dependencies.contains(conflict) {
                errors.push(format!("模块 {} 同时出现在依赖和冲突中", conflict));
            }
        }

        for (key, def) in &self.settings {
            if let Err(reason) = def.validate(&def.default) {
                errors.push(format!("设置项 {} 的默认值无效: {}", key, reason));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ManifestInvalid {
                module_id: self.id.clone(),
                reason: errors.join("; "),
            })
        }
    }

    /// 从 YAML 字符串解析并验证
    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: ModuleManifest = serde_yaml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// 从 JSON 值解析并验证
    ///
    /// 缺少必填字段时返回 [`CoreError::ManifestInvalid`]。
    pub fn from_value(value: Value) -> Result<Self> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let manifest: ModuleManifest =
            serde_json::from_value(value).map_err(|e| CoreError::ManifestInvalid {
                module_id: id,
                reason: e.to_string(),
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// 从文件解析：`.json` 按 JSON，其余按 YAML
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            Self::from_value(serde_json::from_str(&content)?)
        } else {
            Self::from_yaml(&content)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_manifest() {
        let manifest = ModuleManifest::new("Dark_Mode-2", "Dark", "1.0.0-beta")
            .depends_on("theme")
            .setting("level", SettingDefinition::number(3.0).range(0.0, 5.0));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_invalid_id_and_version() {
        let err = ModuleManifest::new("bad id!", "Bad", "1.0").validate().unwrap_err();
        match err {
            CoreError::ManifestInvalid { reason, .. } => {
                assert!(reason.contains("模块 ID"));
                assert!(reason.contains("版本号"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_default_must_satisfy_definition() {
        let manifest = ModuleManifest::new("m", "M", "1.0.0")
            .setting("level", SettingDefinition::number(9.0).range(0.0, 5.0));
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_runtime_version_requirement() {
        let ok = ModuleManifest::new("m", "M", "1.0.0").min_runtime_version(">=0.1.0");
        assert!(ok.validate().is_ok());

        let too_new = ModuleManifest::new("m", "M", "1.0.0").min_runtime_version(">=99.0.0");
        assert!(too_new.validate().is_err());
    }

    #[test]
    fn test_from_value_missing_field() {
        let err = ModuleManifest::from_value(json!({"id": "x", "version": "1.0.0"})).unwrap_err();
        assert!(matches!(err, CoreError::ManifestInvalid { ref module_id, .. } if module_id == "x"));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
id: dark-mode
name: 深色模式
version: 1.2.0
optionalDependencies: [fonts]
conflicts: [high-contrast]
tags: [theme]
settings:
  brightness: { type: number, default: 80, min: 0, max: 100 }
"#;
        let manifest = ModuleManifest::from_yaml(yaml).unwrap();
        assert_eq!(manifest.optional_dependencies, vec!["fonts".to_string()]);
        assert_eq!(manifest.settings["brightness"].default, json!(80));
        assert_eq!(manifest.all_dependencies().count(), 1);
    }
}
