//! 属性应答缓冲区编码（getattrlist 风格）
//!
//! 布局（小端、无填充）:
//!
//! ```text
//! u32 总长度
//! 按规范顺序排列的定长字段（只包含请求的字段）
//! [NAME] u32 名字偏移（相对缓冲区起始），随后是名字字节和 0 终止符
//! ```

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use bitflags::bitflags;
use tracing::{debug, trace};

bitflags! {
    /// 通用属性请求位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const NAME = 0x0000_0001;
        const DEVID = 0x0000_0002;
        const FSID = 0x0000_0004;
        const OBJTYPE = 0x0000_0008;
        const OBJTAG = 0x0000_0010;
        const OBJID = 0x0000_0020;
    }
}

/// vnode 类型
pub const VNON: u32 = 0;
pub const VREG: u32 = 1;
pub const VDIR: u32 = 2;
pub const VLNK: u32 = 5;

/// 对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Regular,
    Directory,
    Link,
}

impl ObjectType {
    /// 目录优先，其次符号链接，其余一律视为普通文件
    pub fn classify(is_dir: bool, is_link: bool) -> Self {
        if is_dir {
            ObjectType::Directory
        } else if is_link {
            ObjectType::Link
        } else {
            ObjectType::Regular
        }
    }

    pub fn vtype(self) -> u32 {
        match self {
            ObjectType::Regular => VREG,
            ObjectType::Directory => VDIR,
            ObjectType::Link => VLNK,
        }
    }
}

/// 编码所需的文件元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub name: String,
    pub dev: u32,
    pub ino: u64,
    pub object_type: ObjectType,
}

impl FileAttributes {
    /// 从宿主文件读取元数据，不跟随符号链接
    ///
    /// `name` 取客户机路径的最后一段，宿主路径只用于 stat。
    pub fn from_host(host: &Path, guest: &str) -> io::Result<Self> {
        let meta = std::fs::symlink_metadata(host)?;
        let name = guest.rsplit('/').next().unwrap_or_default().to_string();
        Ok(Self {
            name,
            dev: meta.dev() as u32,
            ino: meta.ino(),
            object_type: ObjectType::classify(meta.is_dir(), meta.file_type().is_symlink()),
        })
    }
}

/// 单个字段的编码方式
#[derive(Clone, Copy)]
enum FieldEncoder {
    /// 名字的定长部分（含终止符的长度），可变部分追加在末尾
    NameLength,
    U32(fn(&FileAttributes) -> u32),
    U64(fn(&FileAttributes) -> u64),
}

fn dev_id(attrs: &FileAttributes) -> u32 {
    attrs.dev
}

fn obj_type(attrs: &FileAttributes) -> u32 {
    attrs.object_type.vtype()
}

fn obj_id(attrs: &FileAttributes) -> u64 {
    attrs.ino
}

/// 规范编码顺序
const CANONICAL_ORDER: [(AttrMask, FieldEncoder); 4] = [
    (AttrMask::NAME, FieldEncoder::NameLength),
    (AttrMask::DEVID, FieldEncoder::U32(dev_id)),
    (AttrMask::OBJTYPE, FieldEncoder::U32(obj_type)),
    (AttrMask::OBJID, FieldEncoder::U64(obj_id)),
];

/// 属性应答编码器
pub struct AttributeEncoder;

impl AttributeEncoder {
    /// 支持编码的请求位
    pub fn supported() -> AttrMask {
        CANONICAL_ORDER
            .iter()
            .fold(AttrMask::empty(), |mask, (flag, _)| mask | *flag)
    }

    /// 按请求位编码，返回完整的应答缓冲区
    pub fn encode(mask: AttrMask, attrs: &FileAttributes) -> Vec<u8> {
        let ignored = mask - Self::supported();
        if !ignored.is_empty() {
            debug!(?ignored, "忽略不支持的属性请求");
        }

        // 第一遍: 长度占位 + 定长字段
        let mut buf = vec![0u8; 4];
        let name_bytes = attrs.name.len() + 1;
        for (flag, field) in CANONICAL_ORDER {
            if !mask.contains(flag) {
                continue;
            }
            match field {
                FieldEncoder::NameLength => buf.extend_from_slice(&(name_bytes as u32).to_le_bytes()),
                FieldEncoder::U32(get) => buf.extend_from_slice(&get(attrs).to_le_bytes()),
                FieldEncoder::U64(get) => buf.extend_from_slice(&get(attrs).to_le_bytes()),
            }
        }

        // 第二遍: 名字偏移、名字字节，最后回填长度
        if mask.contains(AttrMask::NAME) {
            let offset_at = buf.len();
            buf.extend_from_slice(&[0u8; 4]);
            let name_offset = buf.len() as u32;
            buf[offset_at..offset_at + 4].copy_from_slice(&name_offset.to_le_bytes());
            buf.extend_from_slice(attrs.name.as_bytes());
            buf.push(0);
        }
        let total = buf.len() as u32;
        buf[0..4].copy_from_slice(&total.to_le_bytes());

        trace!(attr = %hex::encode(&buf), "属性应答");
        buf
    }

    /// 应答中名字偏移字段的位置，未请求名字时为 None
    pub fn name_offset_position(mask: AttrMask) -> Option<usize> {
        if !mask.contains(AttrMask::NAME) {
            return None;
        }
        let fixed: usize = CANONICAL_ORDER
            .iter()
            .filter(|(flag, _)| mask.contains(*flag))
            .map(|(_, field)| match field {
                FieldEncoder::NameLength | FieldEncoder::U32(_) => 4,
                FieldEncoder::U64(_) => 8,
            })
            .sum();
        Some(4 + fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn regular_file(name: &str) -> FileAttributes {
        FileAttributes {
            name: name.to_string(),
            dev: 0x1000004,
            ino: 0x1234_5678_9abc,
            object_type: ObjectType::Regular,
        }
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_name_and_objtype() {
        let buf = AttributeEncoder::encode(AttrMask::NAME | AttrMask::OBJTYPE, &regular_file("a.txt"));

        assert_eq!(u32_at(&buf, 0) as usize, buf.len());
        // 名字长度含终止符
        assert_eq!(u32_at(&buf, 4), 6);
        assert_eq!(u32_at(&buf, 8), VREG);
        let name_offset = u32_at(&buf, 12) as usize;
        assert_eq!(&buf[name_offset..], b"a.txt\0");
        assert_eq!(buf.len(), 22);
    }

    #[test]
    fn test_all_fields() {
        let attrs = regular_file("kernel");
        let mask = AttrMask::NAME | AttrMask::DEVID | AttrMask::OBJTYPE | AttrMask::OBJID;
        let buf = AttributeEncoder::encode(mask, &attrs);

        assert_eq!(u32_at(&buf, 0) as usize, buf.len());
        assert_eq!(u32_at(&buf, 8), attrs.dev);
        assert_eq!(u32_at(&buf, 12), VREG);
        assert_eq!(u64::from_le_bytes(buf[16..24].try_into().unwrap()), attrs.ino);
        let at = AttributeEncoder::name_offset_position(mask).unwrap();
        assert_eq!(at, 24);
        let name_offset = u32_at(&buf, at) as usize;
        assert_eq!(&buf[name_offset..name_offset + 6], b"kernel");
        assert_eq!(*buf.last().unwrap(), 0);
    }

    #[test]
    fn test_without_name() {
        let buf = AttributeEncoder::encode(AttrMask::DEVID | AttrMask::OBJID, &regular_file("x"));
        assert_eq!(buf.len(), 4 + 4 + 8);
        assert_eq!(u32_at(&buf, 0), 16);
        assert_eq!(AttributeEncoder::name_offset_position(AttrMask::DEVID), None);
    }

    #[test]
    fn test_unsupported_bits_are_skipped() {
        let buf = AttributeEncoder::encode(AttrMask::FSID | AttrMask::OBJTAG, &regular_file("x"));
        assert_eq!(buf, 4u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_empty_name() {
        let buf = AttributeEncoder::encode(AttrMask::NAME, &regular_file(""));
        let name_offset = u32_at(&buf, 8) as usize;
        assert_eq!(name_offset, 12);
        assert_eq!(&buf[name_offset..], b"\0");
        assert_eq!(u32_at(&buf, 0) as usize, buf.len());
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(ObjectType::classify(true, false).vtype(), VDIR);
        assert_eq!(ObjectType::classify(false, true).vtype(), VLNK);
        assert_eq!(ObjectType::classify(false, false).vtype(), VREG);
    }

    #[test]
    fn test_from_host_detects_link() {
        let dir = std::env::temp_dir().join(format!("osshim-attr-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("file"), b"data").unwrap();
        std::os::unix::fs::symlink(dir.join("file"), dir.join("link")).unwrap();

        let file = FileAttributes::from_host(&dir.join("file"), "/usr/file").unwrap();
        assert_eq!(file.object_type, ObjectType::Regular);
        assert_eq!(file.name, "file");
        let link = FileAttributes::from_host(&dir.join("link"), "link").unwrap();
        assert_eq!(link.object_type, ObjectType::Link);
        let folder = FileAttributes::from_host(&dir, "/tmp/").unwrap();
        assert_eq!(folder.object_type, ObjectType::Directory);
        assert_eq!(folder.name, "");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    proptest! {
        #[test]
        fn prop_length_and_name_offset_match_layout(
            bits in any::<u32>(),
            name in ".{0,40}",
            dev in any::<u32>(),
            ino in any::<u64>(),
            object_type in prop_oneof![
                Just(ObjectType::Regular),
                Just(ObjectType::Directory),
                Just(ObjectType::Link),
            ],
        ) {
            let mask = AttrMask::from_bits_retain(bits);
            let attrs = FileAttributes { name: name.clone(), dev, ino, object_type };
            let buf = AttributeEncoder::encode(mask, &attrs);

            let mut fixed = 0;
            for (flag, width) in [
                (AttrMask::NAME, 4),
                (AttrMask::DEVID, 4),
                (AttrMask::OBJTYPE, 4),
                (AttrMask::OBJID, 8),
            ] {
                if mask.contains(flag) {
                    fixed += width;
                }
            }
            let variable = if mask.contains(AttrMask::NAME) { 4 + name.len() + 1 } else { 0 };
            prop_assert_eq!(buf.len(), 4 + fixed + variable);
            prop_assert_eq!(u32_at(&buf, 0) as usize, buf.len());

            match AttributeEncoder::name_offset_position(mask) {
                Some(at) => {
                    prop_assert!(mask.contains(AttrMask::NAME));
                    prop_assert_eq!(at, 4 + fixed);
                    prop_assert_eq!(u32_at(&buf, 4) as usize, name.len() + 1);
                    let name_offset = u32_at(&buf, at) as usize;
                    prop_assert_eq!(name_offset, at + 4);
                    prop_assert_eq!(&buf[name_offset..buf.len() - 1], name.as_bytes());
                    prop_assert_eq!(buf[buf.len() - 1], 0);
                }
                None => prop_assert!(!mask.contains(AttrMask::NAME)),
            }
        }
    }
}
