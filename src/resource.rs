//! 句柄 / 端口注册表
//!
//! 客户机只能拿到单调递增的数字 id，不会是宿主或客户机地址，
//! 释放过的 id 在同一进程内不再分配。

use std::collections::HashMap;
use std::fmt;
use std::fs::File;

use nohash_hasher::BuildNoHashHasher;
use tracing::debug;

use crate::error::ShimError;

type NoHashHashMap<K, V> = HashMap<K, V, BuildNoHashHasher<K>>;

/// 资源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    Port,
    Thread,
    Event,
    Other,
}

/// 资源负载
pub enum Resource {
    /// 打开的宿主文件和对应的客户机路径
    File { file: File, guest_path: String },
    /// Mach 端口
    Port { name: String },
    /// 不透明数值
    Value(u64),
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::File { guest_path, .. } => f.debug_struct("File").field("guest_path", guest_path).finish(),
            Resource::Port { name } => f.debug_struct("Port").field("name", name).finish(),
            Resource::Value(value) => f.debug_tuple("Value").field(&format_args!("{:#x}", value)).finish(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    kind: ResourceKind,
    resource: Resource,
}

/// 资源注册表
#[derive(Debug)]
pub struct ResourceRegistry {
    entries: NoHashHashMap<u64, Entry>,
    next_id: u64,
}

/// 第一个分配的 id，避开 0 和标准输入输出
pub const FIRST_RESOURCE_ID: u64 = 3;

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::starting_at(FIRST_RESOURCE_ID)
    }

    /// 从指定 id 开始分配
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            entries: NoHashHashMap::default(),
            next_id: first_id.max(1),
        }
    }

    /// 分配新的 id 并保存负载
    pub fn create(&mut self, kind: ResourceKind, resource: Resource) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, ?kind, "创建资源");
        self.entries.insert(id, Entry { kind, resource });
        id
    }

    pub fn lookup(&self, id: u64) -> Result<&Resource, ShimError> {
        self.entries
            .get(&id)
            .map(|entry| &entry.resource)
            .ok_or(ShimError::ResourceNotFound(id))
    }

    pub fn lookup_mut(&mut self, id: u64) -> Result<&mut Resource, ShimError> {
        self.entries
            .get_mut(&id)
            .map(|entry| &mut entry.resource)
            .ok_or(ShimError::ResourceNotFound(id))
    }

    pub fn kind(&self, id: u64) -> Result<ResourceKind, ShimError> {
        self.entries
            .get(&id)
            .map(|entry| entry.kind)
            .ok_or(ShimError::ResourceNotFound(id))
    }

    /// 释放资源，之后对该 id 的查找都会失败
    pub fn release(&mut self, id: u64) -> Result<Resource, ShimError> {
        let entry = self.entries.remove(&id).ok_or(ShimError::ResourceNotFound(id))?;
        debug!(id, kind = ?entry.kind, "释放资源");
        Ok(entry.resource)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let mut registry = ResourceRegistry::new();
        let mut seen = HashSet::new();
        for i in 0..100 {
            let id = registry.create(ResourceKind::Other, Resource::Value(i));
            assert!(seen.insert(id));
            assert!(id >= FIRST_RESOURCE_ID);
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_lookup_after_release() {
        let mut registry = ResourceRegistry::new();
        let id = registry.create(ResourceKind::Port, Resource::Port { name: "shared_region".into() });
        assert!(matches!(registry.lookup(id), Ok(Resource::Port { .. })));
        assert_eq!(registry.kind(id).unwrap(), ResourceKind::Port);

        registry.release(id).unwrap();
        assert!(matches!(registry.lookup(id), Err(ShimError::ResourceNotFound(x)) if x == id));
        assert!(matches!(registry.release(id), Err(ShimError::ResourceNotFound(_))));
    }

    #[test]
    fn test_released_ids_are_not_reused() {
        let mut registry = ResourceRegistry::new();
        let first = registry.create(ResourceKind::Event, Resource::Value(1));
        registry.release(first).unwrap();
        let second = registry.create(ResourceKind::Event, Resource::Value(2));
        assert_ne!(first, second);
        assert!(registry.lookup(first).is_err());
        assert!(matches!(registry.lookup(second), Ok(Resource::Value(2))));
    }

    #[test]
    fn test_unknown_id() {
        let registry = ResourceRegistry::starting_at(0);
        assert!(matches!(registry.lookup(0), Err(ShimError::ResourceNotFound(0))));
    }
}
