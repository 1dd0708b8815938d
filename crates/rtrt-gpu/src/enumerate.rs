//! Capability enumeration.
//!
//! Vulkan returns every variable-length list through the same protocol: call
//! once with a null buffer to learn the count, allocate, then call again to
//! fill. [`enumerate_two_call`] implements that once; the other functions in
//! this module are thin, logged wrappers for the instance-level queries.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;

/// Retrieve a variable-length list using the size-then-fill protocol.
///
/// `query` receives the element count and a destination pointer. On the
/// first call the pointer is null and the callee stores the count; on the
/// second call it writes up to `*count` elements and stores how many it
/// wrote. An `INCOMPLETE` result means the list grew between the two calls,
/// in which case the whole exchange is repeated.
///
/// # Safety
/// `query` must behave like a Vulkan enumeration entry point: never write
/// more than `*count` elements through the pointer and leave `*count` equal
/// to the number of elements written.
pub unsafe fn enumerate_two_call<T, F>(what: &'static str, mut query: F) -> Result<Vec<T>>
where
    F: FnMut(&mut u32, *mut T) -> vk::Result,
{
    loop {
        let mut count = 0u32;
        check(what, query(&mut count, std::ptr::null_mut()))?;

        let mut data: Vec<T> = Vec::with_capacity(count as usize);
        let capacity = count;
        let result = query(&mut count, data.as_mut_ptr());
        if result == vk::Result::INCOMPLETE {
            tracing::debug!("{what}: list changed between calls, retrying");
            continue;
        }
        check(what, result)?;

        // SAFETY: the callee initialized `count` elements, which never
        // exceeds the capacity reserved above.
        unsafe { data.set_len(count.min(capacity) as usize) };
        return Ok(data);
    }
}

fn check(what: &'static str, result: vk::Result) -> Result<()> {
    match result {
        vk::Result::SUCCESS | vk::Result::INCOMPLETE => Ok(()),
        result => Err(GpuError::ResourceQuery { what, result }),
    }
}

/// Instance layers available from the loader.
pub fn instance_layers(entry: &ash::Entry) -> Result<Vec<vk::LayerProperties>> {
    let fp = entry.fp_v1_0().enumerate_instance_layer_properties;
    // SAFETY: fp is the loader's own enumeration entry point.
    let layers = unsafe { enumerate_two_call("instance layers", |count, data| fp(count, data)) }?;

    tracing::debug!("Instance layer count: {}", layers.len());
    for layer in &layers {
        tracing::debug!("\t{}", layer_name(layer));
    }
    Ok(layers)
}

/// Instance extensions available from the loader and implicit layers.
pub fn instance_extensions(entry: &ash::Entry) -> Result<Vec<vk::ExtensionProperties>> {
    let fp = entry.fp_v1_0().enumerate_instance_extension_properties;
    // SAFETY: a null layer name asks for the implementation's extensions.
    let extensions = unsafe {
        enumerate_two_call("instance extensions", |count, data| {
            fp(std::ptr::null(), count, data)
        })
    }?;

    tracing::debug!("Instance extension count: {}", extensions.len());
    for ext in &extensions {
        tracing::debug!("\t{}", extension_name(ext));
    }
    Ok(extensions)
}

/// Extensions supported by one physical device.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<Vec<vk::ExtensionProperties>> {
    let fp = instance.fp_v1_0().enumerate_device_extension_properties;
    // SAFETY: caller guarantees the handles are valid.
    unsafe {
        enumerate_two_call("device extensions", |count, data| {
            fp(physical_device, std::ptr::null(), count, data)
        })
    }
}

/// Name of an extension as an owned string.
pub fn extension_name(props: &vk::ExtensionProperties) -> String {
    props
        .extension_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Name of a layer as an owned string.
pub fn layer_name(props: &vk::LayerProperties) -> String {
    props
        .layer_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Convert a list of static extension names to owned strings.
pub fn names_to_strings(names: &[&CStr]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Behaves like a driver entry point over a fixed list.
    fn fake_query(source: &[u32]) -> impl FnMut(&mut u32, *mut u32) -> vk::Result + '_ {
        move |count, data| {
            if data.is_null() {
                *count = source.len() as u32;
                return vk::Result::SUCCESS;
            }
            let written = (*count as usize).min(source.len());
            for (i, value) in source.iter().take(written).enumerate() {
                unsafe { data.add(i).write(*value) };
            }
            *count = written as u32;
            if written < source.len() {
                vk::Result::INCOMPLETE
            } else {
                vk::Result::SUCCESS
            }
        }
    }

    #[test]
    fn fills_full_list() {
        let source = [4, 8, 15, 16, 23, 42];
        let out = unsafe { enumerate_two_call("numbers", fake_query(&source)) }.unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn tolerates_zero_results() {
        let out: Vec<u32> = unsafe { enumerate_two_call("nothing", fake_query(&[])) }.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn retries_when_list_grows_between_calls() {
        let calls = Cell::new(0u32);
        let query = |count: &mut u32, data: *mut u32| {
            let call = calls.get();
            calls.set(call + 1);
            // First exchange reports 2 items, then 3 exist when filling.
            let len = if call == 0 { 2 } else { 3 };
            if data.is_null() {
                *count = len;
                return vk::Result::SUCCESS;
            }
            let written = (*count).min(len);
            for i in 0..written {
                unsafe { data.add(i as usize).write(i * 10) };
            }
            *count = written;
            if written < len {
                vk::Result::INCOMPLETE
            } else {
                vk::Result::SUCCESS
            }
        };

        let out = unsafe { enumerate_two_call("growing", query) }.unwrap();
        assert_eq!(out, vec![0, 10, 20]);
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn failure_is_a_resource_query_error() {
        let query = |_count: &mut u32, _data: *mut u32| vk::Result::ERROR_INITIALIZATION_FAILED;
        let err = unsafe { enumerate_two_call("broken", query) }.unwrap_err();
        match err {
            GpuError::ResourceQuery { what, result } => {
                assert_eq!(what, "broken");
                assert_eq!(result, vk::Result::ERROR_INITIALIZATION_FAILED);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failure_on_fill_call_is_reported() {
        let query = |count: &mut u32, data: *mut u32| {
            if data.is_null() {
                *count = 2;
                vk::Result::SUCCESS
            } else {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
            }
        };
        let err = unsafe { enumerate_two_call("fill", query) }.unwrap_err();
        assert!(matches!(
            err,
            GpuError::ResourceQuery {
                result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                ..
            }
        ));
    }

    #[test]
    fn extension_names_round_trip_through_properties() {
        let mut props = vk::ExtensionProperties::default();
        let name = b"VK_KHR_swapchain\0";
        for (dst, src) in props.extension_name.iter_mut().zip(name.iter()) {
            *dst = *src as std::ffi::c_char;
        }
        assert_eq!(extension_name(&props), "VK_KHR_swapchain");
    }
}
