//! USB device class glue.
//!
//! [`Ccid`] owns the bulk endpoint pair and the per-interface [`Pipe`]
//! contexts; everything protocol-shaped lives in [`pipe`](crate::pipe).
//! Received packets are fed into the pipe as an unframed byte stream, and the
//! pipe's response is drained one packet per write-ready event, so a slow
//! host never stalls the rest of the device.

use core::convert::TryFrom;

use usb_device::class_prelude::*;

use crate::{
    constants::*,
    pipe::Pipe,
    processor::ApduProcessor,
    registry::{Handle, Registry},
};

type Result<T> = core::result::Result<T, UsbError>;

/// Class-specific control requests (CCID rev 1.1, Sec. 5.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ClassRequest {
    Abort = 0x01,
    GetClockFrequencies = 0x02,
    GetDataRates = 0x03,
}

impl TryFrom<u8> for ClassRequest {
    type Error = ();

    fn try_from(request: u8) -> core::result::Result<Self, ()> {
        Ok(match request {
            0x01 => Self::Abort,
            0x02 => Self::GetClockFrequencies,
            0x03 => Self::GetDataRates,
            _ => return Err(()),
        })
    }
}

pub struct Ccid<Bus>
where
    Bus: 'static + UsbBus,
{
    interface_number: InterfaceNumber,
    read: EndpointOut<'static, Bus>,
    write: EndpointIn<'static, Bus>,
    // TODO: add an interrupt endpoint, so PC/SC does not constantly poll
    // us with GetSlotStatus
    pipes: Registry<Pipe, { NUM_SLOTS as usize }>,
    pipe: Handle,
}

impl<Bus> Ccid<Bus>
where
    Bus: 'static + UsbBus,
{
    pub fn new(allocator: &'static UsbBusAllocator<Bus>) -> Self {
        let read = allocator.bulk(PACKET_SIZE as _);
        let write = allocator.bulk(PACKET_SIZE as _);
        let interface_number = allocator.interface();

        let mut pipes = Registry::new();
        let pipe = match pipes.register(Pipe::new()) {
            Ok(handle) => handle,
            // a fresh registry has room for its first context
            Err(_) => unreachable!(),
        };

        Self {
            interface_number,
            read,
            write,
            pipes,
            pipe,
        }
    }

    fn pipe_mut(&mut self) -> &mut Pipe {
        match self.pipes.get_mut(self.pipe) {
            Some(pipe) => pipe,
            // the handle was issued by this registry at construction
            None => unreachable!(),
        }
    }

    /// Application pump: dispatches at most one buffered command through
    /// `processors` and pushes response bytes toward the host.
    ///
    /// Call this from the main loop, between bus polls.
    pub fn poll(&mut self, processors: &mut [&mut dyn ApduProcessor]) {
        self.pipe_mut().pump(processors);
        self.maybe_send();
    }

    /// Writes at most one chunk of the pending response.
    fn maybe_send(&mut self) {
        let packet_size = self.write.max_packet_size() as usize;
        let write = &mut self.write;
        let pipe = match self.pipes.get_mut(self.pipe) {
            Some(pipe) => pipe,
            None => return,
        };
        let chunk = match pipe.next_chunk(packet_size) {
            Some(chunk) => chunk,
            None => return,
        };
        match write.write(chunk) {
            Ok(n) => pipe.did_send(n, packet_size),
            // endpoint busy, retry on the next write-ready event
            Err(UsbError::WouldBlock) => {}
            Err(_error) => {
                error!("bulk-in write failed: {:?}", _error);
                pipe.reset_state();
            }
        }
    }
}

impl<Bus> UsbClass<Bus> for Ccid<Bus>
where
    Bus: 'static + UsbBus,
{
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface(
            self.interface_number,
            CLASS_CCID,
            SUBCLASS_NONE,
            TRANSFER_MODE_BULK,
        )?;
        writer.write(FUNCTIONAL_INTERFACE, &FUNCTIONAL_INTERFACE_DESCRIPTOR)?;
        writer.endpoint(&self.write)?;
        writer.endpoint(&self.read)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.pipe_mut().reset_state();
    }

    fn poll(&mut self) {
        self.maybe_send();
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr != self.write.address() {
            return;
        }
        self.maybe_send();
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr != self.read.address() {
            return;
        }
        let mut packet = [0u8; PACKET_SIZE];
        match self.read.read(&mut packet) {
            Ok(n) => self.pipe_mut().handle_bytes(&packet[..n]),
            Err(UsbError::WouldBlock) => {}
            Err(_error) => {
                error!("bulk-out read failed: {:?}", _error);
                self.pipe_mut().reset_state();
            }
        }
    }

    fn control_in(&mut self, transfer: ControlIn<Bus>) {
        use usb_device::control::*;
        let Request {
            request_type,
            recipient,
            index,
            request,
            ..
        } = *transfer.request();
        if index as u8 != u8::from(self.interface_number) {
            return;
        }

        if (request_type, recipient) == (RequestType::Class, Recipient::Interface) {
            match ClassRequest::try_from(request) {
                // not strictly needed, as our bNumClockSupported = 0
                Ok(ClassRequest::GetClockFrequencies) => {
                    transfer
                        .accept(|data| {
                            data[..4].copy_from_slice(&CLOCK_FREQUENCY_KHZ);
                            Ok(4)
                        })
                        .ok();
                }

                // not strictly needed, as our bNumDataRatesSupported = 0
                Ok(ClassRequest::GetDataRates) => {
                    transfer
                        .accept(|data| {
                            data[..4].copy_from_slice(&DATA_RATE_BPS);
                            Ok(4)
                        })
                        .ok();
                }

                _ => {
                    info!("unexpected class request (in): {}", request);
                    transfer.reject().ok();
                }
            }
        }
    }

    fn control_out(&mut self, transfer: ControlOut<Bus>) {
        use usb_device::control::*;
        let Request {
            request_type,
            recipient,
            index,
            request,
            ..
        } = *transfer.request();
        if index as u8 != u8::from(self.interface_number) {
            return;
        }

        if (request_type, recipient) == (RequestType::Class, Recipient::Interface) {
            match ClassRequest::try_from(request) {
                Ok(ClassRequest::Abort) => {
                    // drop the in-flight command and any half-flushed response
                    self.pipe_mut().reset_state();
                    transfer.accept().ok();
                }

                _ => {
                    info!("unexpected class request (out): {}", request);
                    transfer.reject().ok();
                }
            }
        }
    }
}
