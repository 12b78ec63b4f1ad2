//! 模块依赖图
//!
//! 依赖图在清单注册时由声明的依赖构建，用于两件事：
//!
//! - 计算加载顺序（Kahn 拓扑排序，稳定的先进先出次序）
//! - 停止模块前查找仍然活动的依赖者
//!
//! # 示例
//!
//! ```rust
//! use chips_runtime::module::dependency::{DependencyGraph, EdgeKind};
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency("a", "b", EdgeKind::Required);
//!
//! let order = graph.resolve_order(&["a".to_string(), "b".to_string()]).unwrap();
//! assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use crate::utils::{CoreError, Result};

/// 依赖边类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// 必需依赖：启动前必须处于活动状态，停止时阻塞
    Required,
    /// 可选依赖：只影响加载顺序
    Optional,
}

/// 模块依赖关系图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 ID -> 该模块依赖的模块列表
    edges: HashMap<String, Vec<(String, EdgeKind)>>,
    /// 反向边：模块 ID -> 依赖该模块的模块列表（按注册顺序）
    reverse_edges: HashMap<String, Vec<(String, EdgeKind)>>,
}

impl DependencyGraph {
    /// 创建一个空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点，已存在时不重复添加
    pub fn add_module(&mut self, module_id: &str) {
        self.edges.entry(module_id.to_string()).or_default();
        self.reverse_edges.entry(module_id.to_string()).or_default();
    }

    /// 添加依赖关系：`module_id` 依赖 `dependency_id`
    ///
    /// 如果模块不存在，会自动添加。
    pub fn add_dependency(&mut self, module_id: &str, dependency_id: &str, kind: EdgeKind) {
        self.add_module(module_id);
        self.add_module(dependency_id);

        let deps = self.edges.entry(module_id.to_string()).or_default();
        if !deps.iter().any(|(d, _)| d == dependency_id) {
            deps.push((dependency_id.to_string(), kind));
        }

        let rev_deps = self.reverse_edges.entry(dependency_id.to_string()).or_default();
        if !rev_deps.iter().any(|(d, _)| d == module_id) {
            rev_deps.push((module_id.to_string(), kind));
        }
    }

    /// 移除模块自己声明的依赖
    ///
    /// 其他模块指向它的边保留：那些声明仍然有效，模块重新注册后继续生效。
    pub fn detach_module(&mut self, module_id: &str) {
        if let Some(deps) = self.edges.remove(module_id) {
            for (dep, _) in deps {
                if let Some(rev_deps) = self.reverse_edges.get_mut(&dep) {
                    rev_deps.retain(|(d, _)| d != module_id);
                }
            }
        }
        if self
            .reverse_edges
            .get(module_id)
            .map_or(false, |dependents| dependents.is_empty())
        {
            self.reverse_edges.remove(module_id);
        }
    }

    /// 获取模块的直接依赖
    pub fn dependencies(&self, module_id: &str, kind: Option<EdgeKind>) -> Vec<String> {
        Self::select(self.edges.get(module_id), kind)
    }

    /// 获取直接依赖该模块的模块
    pub fn dependents(&self, module_id: &str, kind: Option<EdgeKind>) -> Vec<String> {
        Self::select(self.reverse_edges.get(module_id), kind)
    }

    fn select(list: Option<&Vec<(String, EdgeKind)>>, kind: Option<EdgeKind>) -> Vec<String> {
        list.map(|items| {
            items
                .iter()
                .filter(|(_, k)| kind.map_or(true, |want| *k == want))
                .map(|(id, _)| id.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    /// 计算给定模块集合的加载顺序（Kahn 算法）
    ///
    /// 只考虑两端都在 `ids` 中的边（必需与可选依赖都计入）。
    /// 入度为零的候选按入队顺序输出：初始队列按 `ids` 的顺序，
    /// 之后按依赖者的注册顺序入队，因此结果在注册顺序固定时是确定的。
    ///
    /// # 错误
    ///
    /// 存在环时返回 [`CoreError::CircularDependency`]，
    /// 其中列出所有无法排序的模块（按 `ids` 中的顺序）。
    pub fn resolve_order(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let ids: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        let members: HashSet<&str> = ids.iter().map(|id| id.as_str()).collect();

        let mut in_degree: HashMap<&str, usize> = ids
            .iter()
            .map(|id| {
                let degree = self
                    .edges
                    .get(id.as_str())
                    .map_or(0, |deps| {
                        deps.iter()
                            .filter(|(d, _)| members.contains(d.as_str()))
                            .count()
                    });
                (id.as_str(), degree)
            })
            .collect();

        let mut queue: VecDeque<&str> = ids
            .iter()
            .map(|id| id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();

        let mut result = Vec::with_capacity(ids.len());
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());

            if let Some(dependents) = self.reverse_edges.get(node) {
                for (dependent, _) in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }

        if result.len() < ids.len() {
            let resolved: HashSet<&str> = result.iter().map(String::as_str).collect();
            let unresolved = ids
                .iter()
                .filter(|id| !resolved.contains(id.as_str()))
                .map(|id| id.to_string())
                .collect();
            return Err(CoreError::CircularDependency(unresolved));
        }

        Ok(result)
    }

    /// 清空依赖图
    pub fn clear(&mut self) {
        self.edges.clear();
        self.reverse_edges.clear();
    }

    /// 检查图是否为空
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// 检查是否包含指定模块
    pub fn contains_module(&self, module_id: &str) -> bool {
        self.edges.contains_key(module_id)
    }
}
