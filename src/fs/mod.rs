//! 客户机文件系统视图: 沙箱路径转换与属性应答编码

mod attr;
mod path;

pub use attr::{AttrMask, AttributeEncoder, FileAttributes, ObjectType, VDIR, VLNK, VNON, VREG};
pub use path::{PathTranslator, open_flags};
