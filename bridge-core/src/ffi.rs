//! C ABI for driving a bridge client from C/C++ hosts (Android NDK, iOS).
//! The host builds the client and engine in Rust, then hands the client across with [`into_raw`].

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use bytes::Bytes;

use crate::client::Client;
use crate::config::StreamOptions;
use crate::inbound::HttpCallbacks;
use crate::types::{HeaderList, StreamError};

/// One header as borrowed UTF-8 byte ranges.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeHeader {
    pub name: *const u8,
    pub name_len: usize,
    pub value: *const u8,
    pub value_len: usize,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub stream_success: u64,
    pub stream_failure: u64,
    pub stream_cancel: u64,
}

type HeadersFn = extern "C" fn(*mut c_void, *const BridgeHeader, usize, c_int);
type DataFn = extern "C" fn(*mut c_void, *const u8, usize, c_int);
type TrailersFn = extern "C" fn(*mut c_void, *const BridgeHeader, usize);
type SignalFn = extern "C" fn(*mut c_void);
/// context, error code, message ptr, message len, attempt count (-1 if unknown).
type ErrorFn = extern "C" fn(*mut c_void, c_int, *const u8, usize, c_int);

/// Caller callbacks. Null entries are skipped. Invoked on the engine thread.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeCallbacks {
    pub on_headers: Option<HeadersFn>,
    pub on_data: Option<DataFn>,
    pub on_trailers: Option<TrailersFn>,
    pub on_complete: Option<SignalFn>,
    pub on_cancel: Option<SignalFn>,
    pub on_error: Option<ErrorFn>,
    pub context: *mut c_void,
}

struct ForeignCallbacks(BridgeCallbacks);

// The host guarantees `context` may be used from the engine thread.
unsafe impl Send for ForeignCallbacks {}

fn borrowed_headers(headers: &HeaderList) -> Vec<BridgeHeader> {
    headers
        .iter()
        .map(|(n, v)| BridgeHeader {
            name: n.as_ptr(),
            name_len: n.len(),
            value: v.as_ptr(),
            value_len: v.len(),
        })
        .collect()
}

impl HttpCallbacks for ForeignCallbacks {
    fn on_headers(&mut self, headers: HeaderList, end_stream: bool) {
        if let Some(f) = self.0.on_headers {
            let h = borrowed_headers(&headers);
            f(self.0.context, h.as_ptr(), h.len(), end_stream as c_int);
        }
    }

    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        if let Some(f) = self.0.on_data {
            f(self.0.context, data.as_ptr(), data.len(), end_stream as c_int);
        }
    }

    fn on_trailers(&mut self, trailers: HeaderList) {
        if let Some(f) = self.0.on_trailers {
            let h = borrowed_headers(&trailers);
            f(self.0.context, h.as_ptr(), h.len());
        }
    }

    fn on_complete(&mut self) {
        if let Some(f) = self.0.on_complete {
            f(self.0.context);
        }
    }

    fn on_cancel(&mut self) {
        if let Some(f) = self.0.on_cancel {
            f(self.0.context);
        }
    }

    fn on_error(&mut self, error: StreamError) {
        if let Some(f) = self.0.on_error {
            let attempts = error
                .attempt_count
                .and_then(|n| c_int::try_from(n).ok())
                .unwrap_or(-1);
            f(
                self.0.context,
                error.code as c_int,
                error.message.as_ptr(),
                error.message.len(),
                attempts,
            );
        }
    }
}

/// Box a client for the C side. Free with [`bridge_client_release`].
pub fn into_raw(client: Client) -> *mut c_void {
    Box::into_raw(Box::new(client)) as *mut c_void
}

unsafe fn client<'a>(h: *mut c_void) -> Option<&'a Client> {
    (h as *const Client).as_ref()
}

unsafe fn utf8<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    if len == 0 {
        return Some("");
    }
    if ptr.is_null() {
        return None;
    }
    std::str::from_utf8(slice::from_raw_parts(ptr, len)).ok()
}

/// Copy a header array. Null with zero length is an empty list.
unsafe fn read_headers(ptr: *const BridgeHeader, len: usize) -> Option<HeaderList> {
    if len == 0 {
        return Some(HeaderList::new());
    }
    if ptr.is_null() {
        return None;
    }
    let mut out = HeaderList::new();
    for h in slice::from_raw_parts(ptr, len) {
        out.push(utf8(h.name, h.name_len)?, utf8(h.value, h.value_len)?);
    }
    Some(out)
}

/// Start a stream. `async_mode`: -1 client default, 0 sync, 1 async. Returns 0, or -1 on bad input.
#[no_mangle]
pub extern "C" fn bridge_client_start_stream(
    h: *mut c_void,
    stream_id: u64,
    callbacks: *const BridgeCallbacks,
    async_mode: c_int,
) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    let Some(callbacks) = (unsafe { callbacks.as_ref() }) else {
        return -1;
    };
    let options = StreamOptions {
        async_mode: if async_mode < 0 {
            None
        } else {
            Some(async_mode != 0)
        },
    };
    client.start_boxed(stream_id, Box::new(ForeignCallbacks(*callbacks)), options);
    0
}

#[no_mangle]
pub extern "C" fn bridge_client_send_headers(
    h: *mut c_void,
    stream_id: u64,
    headers: *const BridgeHeader,
    headers_len: usize,
    end_stream: c_int,
) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    let Some(headers) = (unsafe { read_headers(headers, headers_len) }) else {
        return -1;
    };
    client.send_headers(stream_id, headers, end_stream != 0);
    0
}

/// Data is copied before return.
#[no_mangle]
pub extern "C" fn bridge_client_send_data(
    h: *mut c_void,
    stream_id: u64,
    data: *const u8,
    len: usize,
    end_stream: c_int,
) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    let data = if len == 0 {
        Bytes::new()
    } else if data.is_null() {
        return -1;
    } else {
        Bytes::copy_from_slice(unsafe { slice::from_raw_parts(data, len) })
    };
    client.send_data(stream_id, data, end_stream != 0);
    0
}

#[no_mangle]
pub extern "C" fn bridge_client_send_metadata(
    h: *mut c_void,
    stream_id: u64,
    metadata: *const BridgeHeader,
    metadata_len: usize,
) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    let Some(metadata) = (unsafe { read_headers(metadata, metadata_len) }) else {
        return -1;
    };
    client.send_metadata(stream_id, metadata);
    0
}

#[no_mangle]
pub extern "C" fn bridge_client_send_trailers(
    h: *mut c_void,
    stream_id: u64,
    trailers: *const BridgeHeader,
    trailers_len: usize,
) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    let Some(trailers) = (unsafe { read_headers(trailers, trailers_len) }) else {
        return -1;
    };
    client.send_trailers(stream_id, trailers);
    0
}

#[no_mangle]
pub extern "C" fn bridge_client_cancel_stream(h: *mut c_void, stream_id: u64) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    client.cancel_stream(stream_id);
    0
}

#[no_mangle]
pub extern "C" fn bridge_client_resume_data(h: *mut c_void, stream_id: u64, bytes: u64) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    client.resume_data(stream_id, bytes);
    0
}

/// Fill `out` with the outcome counters. Returns 0, or -1 if a pointer is null.
#[no_mangle]
pub extern "C" fn bridge_client_stats(h: *mut c_void, out: *mut BridgeStats) -> c_int {
    let Some(client) = (unsafe { client(h) }) else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    let s = client.stats();
    unsafe {
        *out = BridgeStats {
            stream_success: s.stream_success,
            stream_failure: s.stream_failure,
            stream_cancel: s.stream_cancel,
        };
    }
    0
}

/// Free a handle from [`into_raw`]. No-op if h is null.
#[no_mangle]
pub extern "C" fn bridge_client_release(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Client) };
}
