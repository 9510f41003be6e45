//! kernel32 系统信息例程

use tracing::debug;

use crate::context::ShimContext;
use crate::dispatch::{CallContext, CallingConvention, HandlerDescriptor, ParamKind};
use crate::error::ShimError;
use crate::memory::{FieldSpec, FieldWidth, StructSchema, StructValues};

/// 主版本 4，次版本 4
const VERSION: u64 = 0x0004_0004;
const TICK_COUNT: u64 = 200_000;

const PAGE_SIZE: u64 = 0x1000;
const MIN_APPLICATION_ADDRESS: u64 = 0x0040_0000;
const MAX_APPLICATION_ADDRESS: u64 = 0x7ffe_ffff;
const ACTIVE_PROCESSOR_MASK: u64 = 0x3;
const NUMBER_OF_PROCESSORS: u64 = 4;
const PROCESSOR_TYPE: u64 = 0x24a;
const PROCESSOR_LEVEL: u64 = 6;
const PROCESSOR_REVISION: u64 = 0x4601;

const SYSTEM_INFO_32: StructSchema = StructSchema {
    name: "SYSTEM_INFO",
    size: 36,
    fields: &[
        FieldSpec::new("oem_id", 0, FieldWidth::U32),
        FieldSpec::new("page_size", 4, FieldWidth::U32),
        FieldSpec::new("min_application_address", 8, FieldWidth::U32),
        FieldSpec::new("max_application_address", 12, FieldWidth::U32),
        FieldSpec::new("active_processor_mask", 16, FieldWidth::U32),
        FieldSpec::new("number_of_processors", 20, FieldWidth::U32),
        FieldSpec::new("processor_type", 24, FieldWidth::U32),
        FieldSpec::new("allocation_granularity", 28, FieldWidth::U32),
        FieldSpec::new("processor_level", 32, FieldWidth::U16),
        FieldSpec::new("processor_revision", 34, FieldWidth::U16),
    ],
};

const SYSTEM_INFO_64: StructSchema = StructSchema {
    name: "SYSTEM_INFO",
    size: 48,
    fields: &[
        FieldSpec::new("oem_id", 0, FieldWidth::U32),
        FieldSpec::new("page_size", 4, FieldWidth::U32),
        FieldSpec::new("min_application_address", 8, FieldWidth::U64),
        FieldSpec::new("max_application_address", 16, FieldWidth::U64),
        FieldSpec::new("active_processor_mask", 24, FieldWidth::U64),
        FieldSpec::new("number_of_processors", 32, FieldWidth::U32),
        FieldSpec::new("processor_type", 36, FieldWidth::U32),
        FieldSpec::new("allocation_granularity", 40, FieldWidth::U32),
        FieldSpec::new("processor_level", 44, FieldWidth::U16),
        FieldSpec::new("processor_revision", 46, FieldWidth::U16),
    ],
};

fn get_version(_ctx: &mut ShimContext, _call: &CallContext) -> Result<u64, ShimError> {
    Ok(VERSION)
}

fn get_version_ex(_ctx: &mut ShimContext, _call: &CallContext) -> Result<u64, ShimError> {
    Ok(1)
}

fn get_tick_count(_ctx: &mut ShimContext, _call: &CallContext) -> Result<u64, ShimError> {
    Ok(TICK_COUNT)
}

fn get_system_info(ctx: &mut ShimContext, call: &CallContext) -> Result<u64, ShimError> {
    let ptr = call.raw("lpSystemInfo")?;
    if ptr == 0 {
        return Err(ShimError::InvalidArgument("lpSystemInfo 为空".to_string()));
    }
    let schema = match ctx.arch().pointer_width() {
        4 => &SYSTEM_INFO_32,
        _ => &SYSTEM_INFO_64,
    };
    let values = StructValues::new()
        .with("oem_id", 0)
        .with("page_size", PAGE_SIZE)
        .with("min_application_address", MIN_APPLICATION_ADDRESS)
        .with("max_application_address", MAX_APPLICATION_ADDRESS)
        .with("active_processor_mask", ACTIVE_PROCESSOR_MASK)
        .with("number_of_processors", NUMBER_OF_PROCESSORS)
        .with("processor_type", PROCESSOR_TYPE)
        .with("allocation_granularity", PAGE_SIZE * 16)
        .with("processor_level", PROCESSOR_LEVEL)
        .with("processor_revision", PROCESSOR_REVISION);
    ctx.memory().write_struct(ptr, schema, &values)?;
    debug!(ptr = %format!("{:#x}", ptr), size = schema.size, "写入 SYSTEM_INFO");
    Ok(0)
}

pub(super) fn descriptors(cc: CallingConvention) -> Vec<HandlerDescriptor> {
    vec![
        HandlerDescriptor::new("GetVersion", cc, get_version),
        HandlerDescriptor::new("GetVersionExA", cc, get_version_ex).param("lpVersionInformation", ParamKind::Pointer),
        HandlerDescriptor::new("GetVersionExW", cc, get_version_ex).param("lpVersionInformation", ParamKind::Pointer),
        HandlerDescriptor::new("GetTickCount", cc, get_tick_count),
        HandlerDescriptor::new("GetSystemInfo", cc, get_system_info).param("lpSystemInfo", ParamKind::Pointer),
    ]
}
