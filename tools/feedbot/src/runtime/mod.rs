use crate::errors::FeedbotError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), FeedbotError>;

    fn sleep_for(&self, duration: Duration) -> Result<(), FeedbotError> {
        let deadline = self.now() + duration;
        self.sleep_until(deadline)
    }

    fn now_unix_ms(&self) -> i64 {
        unix_millis(self.now())
    }
}

/// Uniform draws in `[0, 1)` used for action selection.
pub trait RandomSource: Send + Sync {
    fn draw(&self) -> f64;
}

/// One draw stream per run. Concurrent runs never share a stream.
pub trait RandomSourceFactory: Send + Sync {
    fn random_for(&self, account_id: &str) -> Arc<dyn RandomSource>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, FeedbotError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FeedbotError>;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), FeedbotError>;
}

pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), FeedbotError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionRandom {
    rng: Mutex<StdRng>,
}

impl ProductionRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replayable source: the same seed yields the same action decisions.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for ProductionRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for ProductionRandom {
    fn draw(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<f64>()
    }
}

/// Entropy-seeded streams, or with a base seed, a stream per account derived
/// from `(seed, account_id)`. An account's draws then match whether it runs
/// alone or beside other accounts.
pub struct ProductionRandomFactory {
    seed: Option<u64>,
}

impl ProductionRandomFactory {
    pub fn from_entropy() -> Self {
        Self { seed: None }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

impl RandomSourceFactory for ProductionRandomFactory {
    fn random_for(&self, account_id: &str) -> Arc<dyn RandomSource> {
        match self.seed {
            Some(seed) => Arc::new(ProductionRandom::seeded(account_seed(seed, account_id))),
            None => Arc::new(ProductionRandom::new()),
        }
    }
}

pub fn account_seed(seed: u64, account_id: &str) -> u64 {
    let mut digest = Sha256::new();
    digest.update(seed.to_le_bytes());
    digest.update(account_id.as_bytes());
    let bytes = digest.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FeedbotError> {
        std::fs::read_to_string(path)
            .map_err(|e| FeedbotError::Io(format!("{}: {e}", path.display())))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FeedbotError> {
        std::fs::read(path).map_err(|e| FeedbotError::Io(format!("{}: {e}", path.display())))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), FeedbotError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| FeedbotError::Io(e.to_string()))
    }
}

pub struct Runtime {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSourceFactory>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl Runtime {
    pub fn production() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            random: Arc::new(ProductionRandomFactory::from_entropy()),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::production()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn at_unix_ms(ms: i64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::at_unix_ms(1_700_000_000_000)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), FeedbotError> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(deadline);
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

/// Scripted draws, falling back to a fixed value once the script runs dry.
#[derive(Clone)]
pub struct FakeRandom {
    script: Arc<Mutex<VecDeque<f64>>>,
    fallback: f64,
    drawn: Arc<Mutex<usize>>,
}

impl FakeRandom {
    pub fn constant(value: f64) -> Self {
        Self::scripted(Vec::new(), value)
    }

    pub fn scripted(draws: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            script: Arc::new(Mutex::new(draws.into_iter().collect())),
            fallback,
            drawn: Arc::new(Mutex::new(0)),
        }
    }

    pub fn draw_count(&self) -> usize {
        *self.drawn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RandomSource for FakeRandom {
    fn draw(&self) -> f64 {
        *self.drawn.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

/// Every run gets a clone, and clones share one script.
impl RandomSourceFactory for FakeRandom {
    fn random_for(&self, _account_id: &str) -> Arc<dyn RandomSource> {
        Arc::new(self.clone())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), contents.into().into_bytes());
        fs
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FeedbotError> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|e| FeedbotError::Io(e.to_string()))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FeedbotError> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| FeedbotError::Io(format!("missing file {}", path.display())))
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), FeedbotError> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_sleep_moves_time_forward_and_records_deadline() {
        let clock = FakeClock::at_unix_ms(1_000);
        clock.sleep_for(Duration::from_millis(250)).expect("sleep");
        assert_eq!(clock.now_unix_ms(), 1_250);
        assert_eq!(clock.sleeps().len(), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now_unix_ms(), 2_250);
    }

    #[test]
    fn fake_random_replays_script_then_falls_back() {
        let random = FakeRandom::scripted([0.1, 0.9], 0.5);
        assert_eq!(random.draw(), 0.1);
        assert_eq!(random.draw(), 0.9);
        assert_eq!(random.draw(), 0.5);
        assert_eq!(random.draw_count(), 3);
    }

    #[test]
    fn seeded_random_is_replayable_and_in_unit_interval() {
        let a = ProductionRandom::seeded(7);
        let b = ProductionRandom::seeded(7);
        for _ in 0..32 {
            let (x, y) = (a.draw(), b.draw());
            assert_eq!(x, y);
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn seeded_factory_derives_a_stable_stream_per_account() {
        let factory = ProductionRandomFactory::seeded(7);
        let a1 = factory.random_for("a");
        let a2 = ProductionRandomFactory::seeded(7).random_for("a");
        let b = factory.random_for("b");
        let a_draws = (0..16).map(|_| a1.draw()).collect::<Vec<_>>();
        assert_eq!(a_draws, (0..16).map(|_| a2.draw()).collect::<Vec<_>>());
        assert_ne!(a_draws, (0..16).map(|_| b.draw()).collect::<Vec<_>>());
        assert_ne!(account_seed(7, "a"), account_seed(8, "a"));
    }

    #[test]
    fn fake_file_system_round_trips_and_reports_missing() {
        let fs = FakeFileSystem::with_file("/cfg.toml", "[run]");
        assert_eq!(fs.read_to_string(Path::new("/cfg.toml")).expect("read"), "[run]");
        let err = fs.read_bytes(Path::new("/nope")).expect_err("missing");
        assert!(matches!(err, FeedbotError::Io(message) if message.contains("/nope")));
    }
}
