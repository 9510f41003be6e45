//! 分区式线性内存

use guest_cpu::{CpuError, Perm};
use rustc_hash::FxHashMap;

/// 后备页大小
const PAGE_SIZE: u64 = 0x1000;

/// 已映射的内存区域
pub struct MappedRegion {
    pub base: u64,
    pub size: u64,
    pub perms: Perm,
    pub name: String,
    /// 以区域内页号为键的稀疏后备页，未写过的页读作 0
    pages: FxHashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
}

impl MappedRegion {
    #[inline(always)]
    fn end(&self) -> u64 {
        self.base + self.size
    }

    /// 已分配的后备页数
    pub fn backed_pages(&self) -> usize {
        self.pages.len()
    }

    fn read_at(&self, mut offset: u64, len: usize, out: &mut Vec<u8>) {
        let mut remaining = len;
        while remaining > 0 {
            let in_page = (offset % PAGE_SIZE) as usize;
            let take = remaining.min(PAGE_SIZE as usize - in_page);
            match self.pages.get(&(offset / PAGE_SIZE)) {
                Some(page) => out.extend_from_slice(&page[in_page..in_page + take]),
                None => out.resize(out.len() + take, 0),
            }
            offset += take as u64;
            remaining -= take;
        }
    }

    fn write_at(&mut self, mut offset: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let in_page = (offset % PAGE_SIZE) as usize;
            let take = (data.len() - done).min(PAGE_SIZE as usize - in_page);
            let page = self
                .pages
                .entry(offset / PAGE_SIZE)
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            page[in_page..in_page + take].copy_from_slice(&data[done..done + take]);
            offset += take as u64;
            done += take;
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("perms", &self.perms)
            .field("name", &self.name)
            .finish()
    }
}

/// 内存管理结构，区域按基地址有序排列
#[derive(Debug, Default)]
pub struct RegionMemory {
    regions: Vec<MappedRegion>,
}

impl RegionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 映射新区域
    pub fn map(&mut self, base: u64, size: u64, perms: Perm, name: &str) -> Result<(), CpuError> {
        let new_end = base
            .checked_add(size)
            .ok_or(CpuError::Unmapped { addr: base, size: size as usize })?;
        if size == 0 {
            return Err(CpuError::Internal(format!("映射 {} 的大小为 0", name)));
        }

        // 检查地址重叠
        for region in &self.regions {
            if base < region.end() && new_end > region.base {
                return Err(CpuError::Overlap { addr: base });
            }
        }

        let index = self.regions.partition_point(|region| region.base < base);
        self.regions.insert(
            index,
            MappedRegion {
                base,
                size,
                perms,
                name: name.to_string(),
                pages: FxHashMap::default(),
            },
        );
        Ok(())
    }

    /// 查找覆盖指定地址的区域
    #[inline(always)]
    fn find_region(&self, addr: u64) -> Option<usize> {
        self.regions
            .binary_search_by(|region| {
                if addr < region.base {
                    std::cmp::Ordering::Greater
                } else if addr >= region.end() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    /// 访问可以跨越首尾相接的多个区域，中间不能有空洞
    pub fn is_mapped(&self, addr: u64, size: usize) -> bool {
        let Some(end) = addr.checked_add(size as u64) else {
            return false;
        };
        let mut cursor = addr;
        loop {
            let Some(index) = self.find_region(cursor) else {
                return false;
            };
            let region_end = self.regions[index].end();
            if end <= region_end {
                return true;
            }
            cursor = region_end;
        }
    }

    /// 读取内存
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, CpuError> {
        if !self.is_mapped(addr, size) {
            return Err(CpuError::Unmapped { addr, size });
        }
        let mut out = Vec::with_capacity(size);
        let mut cursor = addr;
        while out.len() < size {
            let region = &self.regions[self.find_region(cursor).ok_or(CpuError::Unmapped { addr, size })?];
            let take = (size - out.len()).min((region.end() - cursor) as usize);
            region.read_at(cursor - region.base, take, &mut out);
            cursor += take as u64;
        }
        Ok(out)
    }

    /// 写入内存
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError> {
        if !self.is_mapped(addr, data.len()) {
            return Err(CpuError::Unmapped { addr, size: data.len() });
        }
        let mut done = 0;
        let mut cursor = addr;
        while done < data.len() {
            let index = self
                .find_region(cursor)
                .ok_or(CpuError::Unmapped { addr, size: data.len() })?;
            let region = &mut self.regions[index];
            let take = (data.len() - done).min((region.end() - cursor) as usize);
            region.write_at(cursor - region.base, &data[done..done + take]);
            done += take;
            cursor += take as u64;
        }
        Ok(())
    }

    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }
}
