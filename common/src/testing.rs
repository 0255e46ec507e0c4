//! Scripted stand-ins for the network, the flash partition and the device.

use std::{
    collections::HashMap,
    io::{self, Read},
};

use crate::{
    error::{FlashFault, TransportError},
    flash::FlashTarget,
    http::{HttpResponse, HttpTransport},
    updater::DeviceControl,
};

pub const VERSION_URL: &str = "http://fw.test/releases/version.txt";
pub const FIRMWARE_URL: &str = "http://fw.test/releases/firmware.bin";

#[derive(Debug, Clone)]
pub enum FakeRoute {
    Respond {
        status: u16,
        content_length: Option<u64>,
        body: Vec<u8>,
        fail_after: Option<usize>,
    },
    Unreachable(String),
}

impl FakeRoute {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self::Respond {
            status: 200,
            content_length: Some(body.len() as u64),
            body,
            fail_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Respond {
            status,
            content_length: None,
            body: Vec::new(),
            fail_after: None,
        }
    }

    pub fn image(len: usize) -> Self {
        Self::ok(image_bytes(len))
    }
}

pub fn image_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    routes: HashMap<String, FakeRoute>,
    pub requests: Vec<RecordedRequest>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, url: &str, route: FakeRoute) -> Self {
        self.routes.insert(url.to_string(), route);
        self
    }

    pub fn requested(&self, url: &str) -> bool {
        self.requests.iter().any(|request| request.url == url)
    }
}

pub struct FakeBody {
    data: io::Cursor<Vec<u8>>,
    fail_after: Option<usize>,
}

impl Read for FakeBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.data.position() as usize;
        if let Some(limit) = self.fail_after {
            if position >= limit {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
            }
            let allowed = (limit - position).min(buf.len());
            return self.data.read(&mut buf[..allowed]);
        }
        self.data.read(buf)
    }
}

impl HttpTransport for FakeTransport {
    type Body = FakeBody;

    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<Self::Body>, TransportError> {
        self.requests.push(RecordedRequest {
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        });

        match self.routes.get(url).cloned() {
            Some(FakeRoute::Respond {
                status,
                content_length,
                body,
                fail_after,
            }) => Ok(HttpResponse {
                status,
                content_length,
                body: FakeBody {
                    data: io::Cursor::new(body),
                    fail_after,
                },
            }),
            Some(FakeRoute::Unreachable(reason)) => Err(TransportError::Connect(reason)),
            None => Ok(HttpResponse {
                status: 404,
                content_length: Some(0),
                body: FakeBody {
                    data: io::Cursor::new(Vec::new()),
                    fail_after: None,
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashCall {
    Begin(u64),
    Write(usize),
    Finalize,
    Abort,
}

#[derive(Debug)]
pub struct FakeFlash {
    pub capacity: u64,
    pub calls: Vec<FlashCall>,
    pub data: Vec<u8>,
    pub reserved: Option<u64>,
    pub boot_image: Option<Vec<u8>>,
    pub reject_begin: Option<i32>,
    pub reject_finalize: Option<i32>,
    pub fail_write_after: Option<usize>,
}

impl FakeFlash {
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            calls: Vec::new(),
            data: Vec::new(),
            reserved: None,
            boot_image: None,
            reject_begin: None,
            reject_finalize: None,
            fail_write_after: None,
        }
    }

    pub fn count(&self, call: &FlashCall) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                FlashCall::Write(len) => Some(*len),
                _ => None,
            })
            .collect()
    }
}

impl FlashTarget for FakeFlash {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn begin(&mut self, image_size: u64) -> Result<(), FlashFault> {
        self.calls.push(FlashCall::Begin(image_size));
        if let Some(code) = self.reject_begin {
            return Err(FlashFault::Device { code });
        }
        self.reserved = Some(image_size);
        self.data.clear();
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), FlashFault> {
        self.calls.push(FlashCall::Write(chunk.len()));
        let reserved = self.reserved.expect("write before begin");
        if let Some(limit) = self.fail_write_after {
            if self.data.len() + chunk.len() > limit {
                return Err(FlashFault::Device { code: 0x1503 });
            }
        }
        self.data.extend_from_slice(chunk);
        assert!(self.data.len() as u64 <= reserved, "wrote past reservation");
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), FlashFault> {
        self.calls.push(FlashCall::Finalize);
        assert!(self.reserved.take().is_some(), "finalize before begin");
        if let Some(code) = self.reject_finalize {
            return Err(FlashFault::Device { code });
        }
        self.boot_image = Some(self.data.clone());
        Ok(())
    }

    fn abort(&mut self) {
        self.calls.push(FlashCall::Abort);
        self.reserved = None;
    }
}

#[derive(Debug, Default)]
pub struct FakeDevice {
    pub restarts: usize,
}

impl DeviceControl for FakeDevice {
    fn restart(&mut self) {
        self.restarts += 1;
    }
}
