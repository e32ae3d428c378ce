/*!
    simulated robot for host side tests

    the robot side runs in-process: its link serves requests on one end of a tokio duplex stream, the client uses the other end. Motors and LEDs are recorded instead of driven.
*/

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
    };
use futures_concurrency::future::Race;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use log::*;

use swimbus::{
    handlers,
    host::Client,
    locomotion::{Clock, Indicator, Locomotion, LocomotionConfig, MotorAddress, MotorBus},
    robot::Robot,
    table::RegisterTable,
    };


/// settle time used in simulation, shorter than on the real robot
pub const SETTLE: Duration = Duration::from_millis(50);
/// response timeout used in simulation
pub const TIMEOUT: Duration = Duration::from_millis(200);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// locomotion settings used in simulation
pub fn config() -> LocomotionConfig {
    LocomotionConfig {
        settle: SETTLE,
        .. LocomotionConfig::default()
    }
}


/// what a test gets to talk to the simulated robot
pub struct Bench {
    pub client: Client<DuplexStream>,
    pub motors: Motors,
    pub leds: Leds,
}

/// run a test against a simulated robot, in a fresh runtime
pub fn simulate<T, F>(test: T)
where
    T: FnOnce(Bench) -> F,
    F: Future<Output=()>,
{
    init_logging();
    tokio::runtime::Runtime::new()
    .expect("failed to create runtime")
    .block_on(async move {
        let (host, link) = tokio::io::duplex(512);
        let motors = Motors::default();
        let leds = Leds::default();
        let bench = Bench {
            client: Client::new(host, TIMEOUT),
            motors: motors.clone(),
            leds: leds.clone(),
        };
        (
            async {
                tokio::time::timeout(Duration::from_secs(10), test(bench))
                .await.expect("aborted test because took too long");
            },
            run_robot(link, motors, leds),
        ).race().await;
    });
}

/**
    run a robot serving requests on the given stream, until the stream is closed

    the link and the control loop run concurrently, sharing the register table
*/
pub async fn run_robot(link: DuplexStream, motors: Motors, leds: Leds) {
    let config = config();
    let mut table = RegisterTable::new();
    config.seed(&mut table);
    let robot = Robot::new(table, handlers::baseline().expect("conflicting baseline handlers"));
    let mut locomotion = Locomotion::new(robot.registers(), motors, TokioClock::new(), leds, config);
    (
        robot.serve(Link(link)),
        async {locomotion.run().await},
    ).race().await;
    info!("robot stopped");
}

/// run a simulated robot in its own thread and runtime, return the host end of its link
pub fn spawn_robot() -> (DuplexStream, Motors, std::thread::JoinHandle<()>) {
    init_logging();
    let (host, link) = tokio::io::duplex(512);
    let motors = Motors::default();
    let robot_motors = motors.clone();
    let thread = std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create runtime")
            .block_on(run_robot(link, robot_motors, Leds::default()))
    });
    (host, motors, thread)
}


/// `embedded-io-async` view of a tokio stream
pub struct Link(pub DuplexStream);

#[derive(Debug)]
pub struct LinkError(pub std::io::Error);
impl core::fmt::Display for LinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "link failure: {}", self.0)
    }
}
impl core::error::Error for LinkError {}
impl embedded_io_async::Error for LinkError {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        embedded_io_async::ErrorKind::Other
    }
}
impl embedded_io_async::ErrorType for Link {
    type Error = LinkError;
}
impl embedded_io_async::Read for Link {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).await.map_err(LinkError)
    }
}
impl embedded_io_async::Write for Link {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).await.map_err(LinkError)
    }
    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().await.map_err(LinkError)
    }
}


/// wall clock of the tokio runtime
pub struct TokioClock {
    start: tokio::time::Instant,
}
impl TokioClock {
    pub fn new() -> Self {
        Self {start: tokio::time::Instant::now()}
    }
}
impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}


/// command received by a simulated motor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MotorEvent {
    Start(MotorAddress),
    Stop(MotorAddress),
    Setpoint(MotorAddress, i8),
    Led(MotorAddress, u32),
}

/// simulated motor modules, tracking their setpoint instantly
#[derive(Clone, Default)]
pub struct Motors(Arc<Mutex<MotorState>>);

#[derive(Default, Debug)]
struct MotorState {
    events: Vec<MotorEvent>,
    running: BTreeSet<MotorAddress>,
    setpoints: BTreeMap<MotorAddress, i8>,
    broken: BTreeSet<MotorAddress>,
}

/// a simulated motor not answering
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MotorFailure(pub MotorAddress);

impl Motors {
    fn state(&self) -> std::sync::MutexGuard<'_, MotorState> {
        self.0.lock().expect("motor state poisoned")
    }
    /// all commands received so far
    pub fn events(&self) -> Vec<MotorEvent> {
        self.state().events.clone()
    }
    pub fn clear(&self) {
        self.state().events.clear();
    }
    pub fn is_running(&self, motor: MotorAddress) -> bool {
        self.state().running.contains(&motor)
    }
    pub fn setpoint(&self, motor: MotorAddress) -> Option<i8> {
        self.state().setpoints.get(&motor).copied()
    }
    /// make a motor stop answering
    pub fn break_motor(&self, motor: MotorAddress) {
        self.state().broken.insert(motor);
    }
    fn command(&self, motor: MotorAddress, event: MotorEvent) -> Result<std::sync::MutexGuard<'_, MotorState>, MotorFailure> {
        let mut state = self.state();
        if state.broken.contains(&motor)
            {return Err(MotorFailure(motor))}
        state.events.push(event);
        Ok(state)
    }
}
impl MotorBus for Motors {
    type Error = MotorFailure;
    async fn start(&mut self, motor: MotorAddress) -> Result<(), Self::Error> {
        self.command(motor, MotorEvent::Start(motor))?.running.insert(motor);
        Ok(())
    }
    async fn stop(&mut self, motor: MotorAddress) -> Result<(), Self::Error> {
        self.command(motor, MotorEvent::Stop(motor))?.running.remove(&motor);
        Ok(())
    }
    async fn set_setpoint(&mut self, motor: MotorAddress, setpoint: i8) -> Result<(), Self::Error> {
        self.command(motor, MotorEvent::Setpoint(motor, setpoint))?.setpoints.insert(motor, setpoint);
        Ok(())
    }
    async fn position(&mut self, motor: MotorAddress) -> Result<i8, Self::Error> {
        let state = self.state();
        if state.broken.contains(&motor)
            {return Err(MotorFailure(motor))}
        Ok(state.setpoints.get(&motor).copied().unwrap_or(0))
    }
    async fn set_led(&mut self, motor: MotorAddress, color: u32) -> Result<(), Self::Error> {
        self.command(motor, MotorEvent::Led(motor, color))?;
        Ok(())
    }
}

/// head LED, recording every color shown
#[derive(Clone, Default)]
pub struct Leds(Arc<Mutex<Vec<u32>>>);
impl Leds {
    pub fn colors(&self) -> Vec<u32> {
        self.0.lock().expect("led state poisoned").clone()
    }
    pub fn current(&self) -> Option<u32> {
        self.colors().last().copied()
    }
}
impl Indicator for Leds {
    fn set_color(&mut self, color: u32) {
        self.0.lock().expect("led state poisoned").push(color);
    }
}
