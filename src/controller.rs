/*! Controller handles.

A [`Controller`] is the user-facing view of one VESC: typed setters
and getters, terminal access, configuration blobs and firmware
commands. It holds a [`Session`] onto the transport, an optional CAN
node id that gets prefixed onto every outgoing message, and the
keep-alive task.

A [`MultiController`] owns a transport outright and builds one
controller per VESC sharing it, the directly connected one plus any
number reachable over the CAN bus. The shared mutex inside the session
keeps their request/response turns from interleaving.

# Keep-alive

The firmware stops driving the motor when it has not heard from the
host for a safety timeout. The heartbeat task writes the pre-encoded
`alive` packet every 100 ms until told to stop. `stop_heartbeat` joins
the task before returning and must happen before anything that reboots
the device, so the task cannot write into a vanishing port;
[`Controller::jump_to_bootloader`] does this itself.
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::codec::{Message, request_payload};
use crate::field::Value;
use crate::firmware::{Firmware, UploadEvent};
use crate::frame::frame;
use crate::messages::{self, CommandId, FwVersion, Measurements, RotorPositionMode};
use crate::schema::{Registry, Spec};
use crate::session::{Reply, Session, SharedTransport};
use crate::transport::Transport;
use crate::{Error, Result};

/// How often the keep-alive packet is written.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

/// Construction options for one controller.
#[derive(Clone, Copy, Debug)]
pub struct ControllerParams {
    /// CAN node id, or `None` for the directly connected VESC.
    pub can_id: Option<u8>,
    /// Whether the motor has a hall sensor; switches rotor position
    /// reporting off at startup.
    pub has_sensor: bool,
    /// Start the keep-alive task right away.
    pub start_heartbeat: bool,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            can_id: None,
            has_sensor: false,
            start_heartbeat: true,
        }
    }
}

impl ControllerParams {
    /// Parameters for a VESC at the given CAN node id.
    #[must_use]
    pub fn can(can_id: u8) -> Self {
        Self {
            can_id: Some(can_id),
            ..Self::default()
        }
    }
}

struct Heartbeat {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Handle to one VESC.
pub struct Controller {
    session: Session,
    can_id: Option<u8>,
    heartbeat: Option<Heartbeat>,
    alive_packet: Vec<u8>,
    // get_values traffic is frequent, so its request is encoded once.
    get_values_packet: Vec<u8>,
    get_values_len: usize,
}

impl Controller {
    /// Take sole ownership of a transport and talk to the VESC on the
    /// other end, with default parameters and the standard registry.
    pub fn connect<T: Transport + 'static>(transport: T) -> Result<Self> {
        let session = Session::new(transport, Arc::new(messages::standard_registry()));
        Self::with_params(session, ControllerParams::default())
    }

    /// Build a controller on an existing session.
    pub fn with_params(session: Session, params: ControllerParams) -> Result<Self> {
        let registry = session.registry().clone();
        let alive = registry_spec(&registry, CommandId::Alive)?;
        let get_values = registry_spec(&registry, CommandId::GetValues)?;
        let mut ctl = Self {
            alive_packet: frame(&request_payload(&alive, params.can_id))?,
            get_values_packet: frame(&request_payload(&get_values, params.can_id))?,
            get_values_len: get_values.expected_recv_len(),
            session,
            can_id: params.can_id,
            heartbeat: None,
        };
        if params.has_sensor {
            ctl.set_rotor_position_mode(RotorPositionMode::Off)?;
        }
        if params.start_heartbeat {
            ctl.start_heartbeat();
        }
        Ok(ctl)
    }

    /// CAN node id this controller addresses, if any.
    #[must_use]
    pub fn can_id(&self) -> Option<u8> {
        self.can_id
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Start the keep-alive task. Does nothing if it is running.
    pub fn start_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let session = self.session.clone();
        let packet = self.alive_packet.clone();
        let handle = std::thread::spawn(move || {
            debug!("heartbeat task running");
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(HEARTBEAT_PERIOD);
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = session.write(&packet) {
                    // The device may just be rebooting; keep trying.
                    warn!("heartbeat write failed: {e}");
                }
            }
            debug!("heartbeat task stopped");
        });
        self.heartbeat = Some(Heartbeat { stop, handle });
    }

    /// Stop the keep-alive task and wait for it to exit. Safe to call
    /// repeatedly, or when it was never started.
    pub fn stop_heartbeat(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.stop.store(true, Ordering::Relaxed);
            if hb.handle.join().is_err() {
                error!("heartbeat task panicked");
            }
        }
    }

    /// Whether the keep-alive task is running.
    #[must_use]
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Shut the controller down. Idempotent, and safe to call after
    /// the device has already disappeared.
    pub fn close(&mut self) {
        self.stop_heartbeat();
    }

    /// Set PWM duty cycle, range -1 to 1.
    pub fn set_duty(&self, duty_cycle: f64) -> Result<()> {
        self.send(CommandId::SetDuty, vec![duty_cycle.into()])
    }

    /// Set motor current in mA.
    pub fn set_current(&self, current: f64) -> Result<()> {
        self.send(CommandId::SetCurrent, vec![current.into()])
    }

    /// Set braking current in mA.
    pub fn set_current_brake(&self, current_brake: f64) -> Result<()> {
        self.send(CommandId::SetCurrentBrake, vec![current_brake.into()])
    }

    /// Set electrical RPM, i.e. the rotation rate of the stator field.
    pub fn set_rpm(&self, rpm: i32) -> Result<()> {
        self.send(CommandId::SetRpm, vec![rpm.into()])
    }

    /// Set the position setpoint in degrees.
    pub fn set_pos(&self, pos: f64) -> Result<()> {
        self.send(CommandId::SetPos, vec![pos.into()])
    }

    /// Set servo output position, range 0 to 1.
    pub fn set_servo(&self, servo_pos: f64) -> Result<()> {
        self.send(CommandId::SetServoPos, vec![servo_pos.into()])
    }

    /// Select how the rotor position is reported.
    pub fn set_rotor_position_mode(&self, mode: RotorPositionMode) -> Result<()> {
        self.send(CommandId::SetDetect, vec![(mode as u8).into()])
    }

    /// Reboot the controller. No response is expected.
    pub fn reboot(&self) -> Result<()> {
        let spec = self.spec(CommandId::Reboot)?;
        self.session
            .write(&frame(&request_payload(&spec, self.can_id))?)
    }

    /// Fetch a measurement snapshot.
    ///
    /// Needs the standard registry; against firmware older than 3.33
    /// use [`Controller::measurements_message`] and read fields by
    /// name.
    pub fn get_measurements(&self) -> Result<Measurements> {
        Measurements::try_from(&self.measurements_message()?)
    }

    /// Fetch a measurement snapshot as a raw message.
    pub fn measurements_message(&self) -> Result<Message> {
        let reply =
            self.session
                .request(&self.get_values_packet, self.get_values_len, false)?;
        reply.into_message().ok_or(Error::MalformedPayload {
            id: CommandId::GetValues as u8,
            reason: "expected a binary reply",
        })
    }

    /// Current electrical RPM.
    pub fn rpm(&self) -> Result<i32> {
        Ok(self.get_measurements()?.rpm)
    }

    /// Currently applied duty cycle.
    pub fn duty_cycle(&self) -> Result<f64> {
        Ok(self.get_measurements()?.duty_cycle_now)
    }

    /// Current input voltage.
    pub fn v_in(&self) -> Result<f64> {
        Ok(self.get_measurements()?.v_in)
    }

    /// Current motor current.
    pub fn motor_current(&self) -> Result<f64> {
        Ok(self.get_measurements()?.avg_motor_current)
    }

    /// Current battery side current.
    pub fn input_current(&self) -> Result<f64> {
        Ok(self.get_measurements()?.avg_input_current)
    }

    /// Ask the device for its firmware version.
    pub fn get_firmware_version(&self) -> Result<FwVersion> {
        let reply = self.request_empty(CommandId::FwVersion, false)?;
        let msg = reply.into_message().ok_or(Error::MalformedPayload {
            id: CommandId::FwVersion as u8,
            reason: "expected a binary reply",
        })?;
        FwVersion::try_from(&msg)
    }

    /// Run a terminal command and return its output, which may span
    /// several print frames.
    pub fn terminal_cmd(&self, cmd: &str) -> Result<String> {
        let reply = self.call(CommandId::TerminalCmd, vec![cmd.into()], true)?;
        reply.into_text().ok_or(Error::MalformedPayload {
            id: CommandId::TerminalCmd as u8,
            reason: "expected a text reply",
        })
    }

    /// Read the motor configuration blob.
    pub fn get_motor_config(&self) -> Result<Vec<u8>> {
        let reply = self.request_empty(CommandId::GetMcConf, true)?;
        reply.into_blob().ok_or(Error::MalformedPayload {
            id: CommandId::GetMcConf as u8,
            reason: "expected a bytes reply",
        })
    }

    /// Write the motor configuration blob.
    pub fn set_motor_config(&self, data: &[u8]) -> Result<()> {
        self.call(CommandId::SetMcConf, vec![data.into()], true)?;
        Ok(())
    }

    /// Read the app configuration blob.
    pub fn get_app_config(&self) -> Result<Vec<u8>> {
        let reply = self.request_empty(CommandId::GetAppConf, true)?;
        reply.into_blob().ok_or(Error::MalformedPayload {
            id: CommandId::GetAppConf as u8,
            reason: "expected a bytes reply",
        })
    }

    /// Write the app configuration blob.
    pub fn set_app_config(&self, data: &[u8]) -> Result<()> {
        self.call(CommandId::SetAppConf, vec![data.into()], true)?;
        Ok(())
    }

    /// Erase room for a new app image in flash.
    ///
    /// Fails with [`Error::FirmwareEraseFailed`] when the device does
    /// not acknowledge.
    pub fn erase_new_app(&self, size: u32) -> Result<()> {
        let reply = self.call(CommandId::EraseNewApp, vec![size.into()], false)?;
        let ok = reply
            .into_message()
            .and_then(|m| m.int("erase_new_app_result"))
            == Some(1);
        if ok { Ok(()) } else { Err(Error::FirmwareEraseFailed) }
    }

    /// Write one firmware chunk at the given flash offset.
    pub fn write_new_app_data(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.write_app_chunk(CommandId::WriteNewAppData, offset, data)
    }

    /// Write one LZO compressed firmware chunk. The chunk must
    /// already be compressed; this only labels it as such.
    pub fn write_new_app_data_lzo(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.write_app_chunk(CommandId::WriteNewAppDataLzo, offset, data)
    }

    fn write_app_chunk(&self, id: CommandId, offset: u32, data: &[u8]) -> Result<()> {
        let reply = self.call(id, vec![offset.into(), data.into()], false)?;
        let ok = reply
            .into_message()
            .and_then(|m| m.int("write_new_app_result"))
            == Some(1);
        if ok { Ok(()) } else { Err(Error::FirmwareWriteFailed) }
    }

    /// Reset into the bootloader. Stops the heartbeat first and does
    /// not wait for a reply; the device is gone once this is sent.
    pub fn jump_to_bootloader(&mut self) -> Result<()> {
        self.stop_heartbeat();
        let spec = self.spec(CommandId::JumpToBootloader)?;
        self.session
            .write(&frame(&request_payload(&spec, self.can_id))?)
    }

    /// Stream a firmware image to the device. See
    /// [`crate::firmware::upload`].
    pub fn update_firmware<F>(
        &mut self,
        fw: &mut dyn Firmware,
        use_lzo: bool,
        progress: F,
    ) -> Result<bool>
    where
        F: FnMut(UploadEvent),
    {
        crate::firmware::upload(self, fw, use_lzo, progress)
    }

    /// Pick up an unsolicited frame, e.g. a debug print from the
    /// device. Returns immediately when nothing is buffered.
    pub fn probe(&self) -> Result<Option<Reply>> {
        self.session.probe()
    }

    fn spec(&self, id: CommandId) -> Result<Arc<Spec>> {
        registry_spec(self.session.registry(), id)
    }

    fn send(&self, id: CommandId, values: Vec<Value>) -> Result<()> {
        let msg = Message::compose(self.spec(id)?, values)?.with_can_id(self.can_id);
        self.session.write(&frame(&msg.pack()?)?)
    }

    fn call(&self, id: CommandId, values: Vec<Value>, expect_string: bool) -> Result<Reply> {
        let spec = self.spec(id)?;
        let expected = spec.expected_recv_len();
        let msg = Message::compose(spec, values)?.with_can_id(self.can_id);
        self.session
            .request(&frame(&msg.pack()?)?, expected, expect_string)
    }

    fn request_empty(&self, id: CommandId, expect_string: bool) -> Result<Reply> {
        let spec = self.spec(id)?;
        let packet = frame(&request_payload(&spec, self.can_id))?;
        self.session
            .request(&packet, spec.expected_recv_len(), expect_string)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

fn registry_spec(registry: &Registry, id: CommandId) -> Result<Arc<Spec>> {
    registry
        .get(id as u8)
        .cloned()
        .ok_or(Error::UnknownMessageId(id as u8))
}

/// Several VESCs sharing one serial line.
///
/// Owns the transport; every controller goes through the same mutex,
/// so request/response turns on the wire never interleave.
pub struct MultiController {
    transport: SharedTransport,
    registry: Arc<Registry>,
    controllers: Vec<Controller>,
}

impl MultiController {
    /// Build one controller per parameter set, all sharing the
    /// transport, with the standard registry.
    pub fn new<T: Transport + 'static>(transport: T, params: Vec<ControllerParams>) -> Result<Self> {
        Self::with_registry(transport, Arc::new(messages::standard_registry()), params)
    }

    /// Like [`MultiController::new`] with an explicit registry, e.g.
    /// [`messages::pre_v3_registry`] for old firmware.
    pub fn with_registry<T: Transport + 'static>(
        transport: T,
        registry: Arc<Registry>,
        params: Vec<ControllerParams>,
    ) -> Result<Self> {
        let shared: SharedTransport = Arc::new(std::sync::Mutex::new(Box::new(transport)));
        let mut controllers = Vec::with_capacity(params.len());
        for p in params {
            let session = Session::from_shared(shared.clone(), registry.clone());
            controllers.push(Controller::with_params(session, p)?);
        }
        Ok(Self {
            transport: shared,
            registry,
            controllers,
        })
    }

    /// The controllers, in construction order.
    #[must_use]
    pub fn controllers_mut(&mut self) -> &mut [Controller] {
        &mut self.controllers
    }

    /// One controller by index.
    #[must_use]
    pub fn controller_mut(&mut self, index: usize) -> Option<&mut Controller> {
        self.controllers.get_mut(index)
    }

    /// Number of controllers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// True when no controllers were configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// The shared transport handle.
    #[must_use]
    pub fn transport(&self) -> SharedTransport {
        self.transport.clone()
    }

    /// The registry all controllers decode with.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop every controller's heartbeat.
    pub fn close(&mut self) {
        for c in &mut self.controllers {
            c.close();
        }
    }
}
