//! BSD 层文件系统调用

use tracing::debug;

use crate::context::ShimContext;
use crate::dispatch::{CallContext, CallingConvention, HandlerDescriptor, ParamKind};
use crate::error::ShimError;
use crate::fs::{AttrMask, AttributeEncoder, FileAttributes};
use crate::memory::SharedFileMapping;
use crate::resource::{Resource, ResourceKind};
use crate::shared_region::{SHARED_REGION_BASE_X86_64, SHARED_REGION_SIZE_X86_64};

/// 系统调用失败时返回 -1
const SYSCALL_FAILURE: u64 = u64::MAX;

/// struct attrlist 中 commonattr 的偏移
const ATTRLIST_COMMONATTR_OFFSET: usize = 4;

fn required_path<'a>(call: &'a CallContext) -> Result<&'a str, ShimError> {
    call.string("path")?
        .ok_or_else(|| ShimError::InvalidArgument(format!("{} 的路径为空指针", call.routine)))
}

/// getattrlist(path, attrList, attrBuf, attrBufSize, options)
///
/// 应答超过缓冲区大小时截断写入，长度字段保持为完整长度。
fn getattrlist(ctx: &mut ShimContext, call: &CallContext) -> Result<u64, ShimError> {
    let path = required_path(call)?;
    let alist = call.raw("alist")?;
    let attr_buf = call.raw("attributeBuffer")?;
    let buf_size = call.raw("bufferSize")? as usize;

    let common = ctx.memory().read_field(alist, ATTRLIST_COMMONATTR_OFFSET, 4)? as u32;
    let mask = AttrMask::from_bits_retain(common);

    if !ctx.paths.exists(path) {
        return Err(ShimError::NotFound(path.to_string()));
    }
    let host = ctx.paths.to_host_path(path)?;
    let attrs = FileAttributes::from_host(&host, path).map_err(|_| ShimError::NotFound(path.to_string()))?;
    let encoded = AttributeEncoder::encode(mask, &attrs);

    let len = encoded.len().min(buf_size);
    ctx.memory().write(attr_buf, &encoded[..len])?;
    debug!(path, mask = ?mask, len, "getattrlist");
    Ok(0)
}

/// open(path, flags, mode)，返回资源 id 作为描述符
fn open(ctx: &mut ShimContext, call: &CallContext) -> Result<u64, ShimError> {
    let path = required_path(call)?;
    let flags = call.raw("flags")? as u32;
    let mode = call.raw("mode")? as u32;

    let file = ctx.paths.open(path, flags, mode)?;
    let fd = ctx.resources.create(
        ResourceKind::File,
        Resource::File { file, guest_path: path.to_string() },
    );
    debug!(path, flags = %format!("{:#x}", flags), fd, "open");
    Ok(fd)
}

/// close(fd)
fn close(ctx: &mut ShimContext, call: &CallContext) -> Result<u64, ShimError> {
    let fd = call.raw("fd")?;
    if ctx.resources.kind(fd)? != ResourceKind::File {
        return Err(ShimError::ResourceNotFound(fd));
    }
    ctx.resources.release(fd)?;
    Ok(0)
}

/// shared_region_check_np(start_address*)，未进入共享区域时失败
fn shared_region_check_np(ctx: &mut ShimContext, call: &CallContext) -> Result<u64, ShimError> {
    let out = call.raw("start_address")?;
    if ctx.shared_region.shared_region_port().is_none() {
        return Err(ShimError::InvalidArgument("共享缓存区域尚未建立".to_string()));
    }
    ctx.memory().write_u64(out, SHARED_REGION_BASE_X86_64)?;
    Ok(0)
}

/// shared_region_map_np(fd, count, mappings)
///
/// 进入共享区域并校验每条映射描述都落在区域内，文件内容不加载。
fn shared_region_map_np(ctx: &mut ShimContext, call: &CallContext) -> Result<u64, ShimError> {
    let count = call.raw("count")?;
    let mappings = call.raw("mappings")?;
    ctx.enter_shared_region()?;

    let region_end = SHARED_REGION_BASE_X86_64 + SHARED_REGION_SIZE_X86_64;
    for index in 0..count {
        let addr = mappings + index * SharedFileMapping::SIZE as u64;
        let mapping = SharedFileMapping::read_from(&ctx.memory(), addr)?;
        let inside = mapping.address >= SHARED_REGION_BASE_X86_64
            && mapping
                .address
                .checked_add(mapping.size)
                .is_some_and(|end| end <= region_end);
        if !inside {
            return Err(ShimError::InvalidArgument(format!(
                "映射 {:#x}+{:#x} 不在共享缓存区域内",
                mapping.address, mapping.size
            )));
        }
    }
    Ok(0)
}

pub(super) fn descriptors(cc: CallingConvention) -> Vec<HandlerDescriptor> {
    vec![
        HandlerDescriptor::new("getattrlist", cc, getattrlist)
            .param("path", ParamKind::CString)
            .param("alist", ParamKind::Pointer)
            .param("attributeBuffer", ParamKind::Pointer)
            .param("bufferSize", ParamKind::Int)
            .param("options", ParamKind::Int)
            .failure_return(SYSCALL_FAILURE),
        HandlerDescriptor::new("open", cc, open)
            .param("path", ParamKind::CString)
            .param("flags", ParamKind::Int)
            .param("mode", ParamKind::Int)
            .failure_return(SYSCALL_FAILURE),
        HandlerDescriptor::new("close", cc, close)
            .param("fd", ParamKind::Handle)
            .failure_return(SYSCALL_FAILURE),
        HandlerDescriptor::new("shared_region_check_np", cc, shared_region_check_np)
            .param("start_address", ParamKind::Pointer)
            .failure_return(SYSCALL_FAILURE),
        HandlerDescriptor::new("shared_region_map_np", cc, shared_region_map_np)
            .param("fd", ParamKind::Handle)
            .param("count", ParamKind::Int)
            .param("mappings", ParamKind::Pointer)
            .failure_return(SYSCALL_FAILURE),
    ]
}
