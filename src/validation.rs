//! Validation layer plumbing.
//!
//! Messages always go to the `log` facade. With the `validation-channel`
//! feature they are also written to a local byte stream as
//! `severity\x08type\x08message\0` for an external debugger to display.

use std::ffi::{c_void, CStr};
use std::io::{self, Write};

use vulkanalia::prelude::v1_0::*;

#[cfg(windows)]
pub const DEFAULT_CHANNEL: &str = r"\\.\pipe\VkValidationDebugger";
#[cfg(not(windows))]
pub const DEFAULT_CHANNEL: &str = "/tmp/VkValidationDebugger";

const FIELD_SEPARATOR: u8 = 0x08;

/// Builds one wire record. Severity and type are written as their decimal
/// flag values.
pub fn encode_message(severity: u32, type_: u32, message: &str) -> Vec<u8> {
    let mut record = Vec::with_capacity(message.len() + 24);
    record.extend_from_slice(severity.to_string().as_bytes());
    record.push(FIELD_SEPARATOR);
    record.extend_from_slice(type_.to_string().as_bytes());
    record.push(FIELD_SEPARATOR);
    record.extend_from_slice(message.as_bytes());
    record.push(0);
    record
}

#[cfg(not(windows))]
type Channel = std::os::unix::net::UnixStream;
#[cfg(windows)]
type Channel = std::fs::File;

/// Write end of the debugger channel.
pub struct ValidationClient {
    channel: Channel,
}

impl ValidationClient {
    #[cfg(not(windows))]
    pub fn connect(name: &str) -> io::Result<Self> {
        let channel = std::os::unix::net::UnixStream::connect(name)?;
        Ok(Self { channel })
    }

    #[cfg(windows)]
    pub fn connect(name: &str) -> io::Result<Self> {
        let channel = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(name)?;
        Ok(Self { channel })
    }

    #[cfg(not(windows))]
    pub fn from_stream(channel: std::os::unix::net::UnixStream) -> Self {
        Self { channel }
    }

    pub fn send(&self, severity: u32, type_: u32, message: &str) -> io::Result<()> {
        (&self.channel).write_all(&encode_message(severity, type_, message))
    }
}

/// Registered as the debug messenger callback. `user_data` is either null or
/// a `*const ValidationClient` that outlives the messenger.
pub extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> vk::Bool32 {
    let data = unsafe { *data };
    let message = unsafe { CStr::from_ptr(data.message) }.to_string_lossy();

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("({:?}) {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("({:?}) {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        log::debug!("({:?}) {}", type_, message);
    } else {
        log::trace!("({:?}) {}", type_, message);
    }

    if !user_data.is_null() {
        let client = unsafe { &*(user_data as *const ValidationClient) };
        if let Err(e) = client.send(severity.bits(), type_.bits(), &message) {
            log::trace!("Dropped validation message for channel: {}", e);
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let record = encode_message(4096, 2, "bad barrier");
        assert_eq!(record, b"4096\x082\x08bad barrier\0".to_vec());
    }

    #[test]
    fn empty_message_still_terminated() {
        let record = encode_message(1, 1, "");
        assert_eq!(record.last(), Some(&0));
        assert_eq!(record.iter().filter(|b| **b == FIELD_SEPARATOR).count(), 2);
    }

    #[cfg(not(windows))]
    #[test]
    fn client_writes_records_to_stream() {
        use std::io::Read;
        use std::os::unix::net::UnixStream;

        let (writer, mut reader) = UnixStream::pair().unwrap();
        let client = ValidationClient::from_stream(writer);
        client.send(256, 1, "first").unwrap();
        client.send(16, 4, "second").unwrap();
        drop(client);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();

        let records: Vec<&[u8]> = received.split(|b| *b == 0).filter(|r| !r.is_empty()).collect();
        assert_eq!(records, vec![&b"256\x081\x08first"[..], &b"16\x084\x08second"[..]]);
    }
}
