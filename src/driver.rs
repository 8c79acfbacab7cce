//! Camera driver: external write/read routing and the acquisition loop.
//!
//! [`CameraDriver`] is the seam where an external parameter server attaches.
//! Its `write` path rejects readonly names, dispatches command-tagged names
//! through a handler map registered at construction, and raises the
//! reconfigure flag when a config-tagged value actually changes. The
//! acquisition loop consumes timing events from the listener, applies any
//! pending reconfiguration without stalling, and publishes one simulated
//! frame per event.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use rand_distr::{Distribution, Normal};
use tracing::{debug, error, info, warn};

use crate::catalog::PixelKind;
use crate::error::{AppResult, CamError};
use crate::store::{ParamValue, ParameterStore};
use crate::timing::TimestampListener;

/// Invoked with a snapshot of all config-tagged values whenever a pending
/// reconfiguration is applied.
pub type ConfigCallback = Arc<dyn Fn(&BTreeMap<String, ParamValue>) -> AppResult<()> + Send + Sync>;

/// Behavior bound to a command-tagged parameter name. Returns whether the
/// written value should also be stored.
pub type CommandHandler = Arc<dyn Fn(&ParamValue) -> bool + Send + Sync>;

pub struct CameraDriver {
    store: Arc<ParameterStore>,
    listener: TimestampListener,
    pixel: PixelKind,
    run: Arc<AtomicBool>,
    need_config: AtomicBool,
    config_keys: BTreeSet<String>,
    readonly: HashSet<String>,
    commands: HashMap<String, CommandHandler>,
    config_op: Option<ConfigCallback>,
    frames: AtomicU64,
    start_secs: i64,
    start_tod: String,
}

impl CameraDriver {
    /// Resolve the tag sets and the command-handler map from the catalog.
    /// `SYSRESET` is bound to clearing the shared run flag; any other
    /// command-tagged name without a handler is reported at construction.
    pub fn new(
        store: Arc<ParameterStore>,
        listener: TimestampListener,
        pixel: PixelKind,
        config_op: Option<ConfigCallback>,
    ) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let readonly: HashSet<String> = store.tagged(|spec| spec.readonly).into_iter().collect();
        let config_keys: BTreeSet<String> = store.tagged(|spec| spec.config).into_iter().collect();

        let mut commands: HashMap<String, CommandHandler> = HashMap::new();
        for name in store.tagged(|spec| spec.command) {
            if name == "SYSRESET" {
                let flag = run.clone();
                commands.insert(
                    name,
                    Arc::new(move |_value: &ParamValue| {
                        info!("system reset requested, stopping acquisition");
                        flag.store(false, Ordering::SeqCst);
                        true
                    }),
                );
            } else {
                warn!(name = %name, "command parameter has no registered handler");
            }
        }

        let now = Local::now();
        Self {
            store,
            listener,
            pixel,
            run,
            need_config: AtomicBool::new(false),
            config_keys,
            readonly,
            commands,
            config_op,
            frames: AtomicU64::new(0),
            start_secs: now.timestamp(),
            start_tod: now.format("%m/%d/%Y %H:%M:%S").to_string(),
        }
    }

    pub fn store(&self) -> &Arc<ParameterStore> {
        &self.store
    }

    pub fn listener(&self) -> &TimestampListener {
        &self.listener
    }

    /// Shared run flag; cleared by `SYSRESET` or [`Self::request_stop`].
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        self.run.clone()
    }

    pub fn request_stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn reconfigure_pending(&self) -> bool {
        self.need_config.load(Ordering::SeqCst)
    }

    // =========================================================================
    // External parameter-server surface
    // =========================================================================

    /// Write path for the external parameter server. Returns whether the
    /// write was accepted.
    pub async fn write(&self, name: &str, value: ParamValue) -> bool {
        if self.store.spec(name).is_none() {
            warn!(name = %name, "write to unknown parameter");
            return false;
        }
        if self.readonly.contains(name) {
            warn!(name = %name, "parameter is read-only");
            return false;
        }

        if let Some(handler) = self.commands.get(name) {
            if !handler(&value) {
                return false;
            }
            if let Err(err) = self.store.set(name, value).await {
                warn!(name = %name, %err, "rejected parameter write");
                return false;
            }
            return true;
        }

        let previous = if self.config_keys.contains(name) {
            self.store.get(name).await
        } else {
            None
        };
        if let Err(err) = self.store.set(name, value).await {
            warn!(name = %name, %err, "rejected parameter write");
            return false;
        }
        // Edge-triggered, compared after any enum coercion: only an
        // accepted write that changed the stored value schedules a
        // reconfiguration.
        if self.config_keys.contains(name) && self.store.get(name).await != previous {
            self.need_config.store(true, Ordering::SeqCst);
            debug!(name = %name, "configuration parameter changed, reconfigure scheduled");
        }
        true
    }

    /// Read path for the external parameter server. Administrative values
    /// are computed on demand; everything else comes from the store.
    pub async fn read(&self, name: &str) -> Option<ParamValue> {
        match name {
            "HEARTBEAT" => Some(ParamValue::Int(Local::now().timestamp() - self.start_secs)),
            "TOD" => Some(ParamValue::Str(
                Local::now().format("%m/%d/%Y %H:%M:%S").to_string(),
            )),
            "STARTTOD" => Some(ParamValue::Str(self.start_tod.clone())),
            _ => self.store.get(name).await,
        }
    }

    /// Current values of every config-tagged parameter.
    pub async fn config_values(&self) -> BTreeMap<String, ParamValue> {
        let mut values = BTreeMap::new();
        for name in &self.config_keys {
            if let Some(value) = self.store.get(name).await {
                values.insert(name.clone(), value);
            }
        }
        values
    }

    // =========================================================================
    // Acquisition loop
    // =========================================================================

    /// Run the acquisition loop until the run flag clears.
    ///
    /// Starts the listener first; a bind failure is fatal and surfaces to the
    /// caller. The listener is stopped on every exit path, normal or error,
    /// before this returns.
    pub async fn acquire(&self) -> AppResult<()> {
        info!("acquiring data");
        self.listener.start().await?;
        let result = self.acquire_loop().await;
        self.listener.stop(true).await;
        result
    }

    async fn acquire_loop(&self) -> AppResult<()> {
        while self.run.load(Ordering::SeqCst) {
            // Always read fresh: any of these may have changed since the
            // last cycle.
            let rows = self.int_param("IMAGE1:ArraySize1_RBV").await?;
            let cols = self.int_param("IMAGE1:ArraySize0_RBV").await?;
            let timeout = self.float_param("TIMEOUT").await?.max(0.0);
            let offset = self.float_param("OFFSET").await?;
            let scale = self.float_param("SCALE").await?;

            let wait = Duration::try_from_secs_f64(timeout).unwrap_or(Duration::MAX);
            let event = match self.listener.get(wait).await {
                Ok(event) => event,
                Err(err) if err.is_timeout() => {
                    debug!("waiting for daq timestamp timed out after {timeout:.1} s");
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.maybe_reconfigure().await;

            let frame = synthesize_frame(self.pixel, rows, cols, offset, scale);
            let elements = (frame.len() / self.pixel.byte_width()) as i64;
            self.frames.fetch_add(1, Ordering::SeqCst);

            self.store
                .set("FIDUCIAL", ParamValue::Int(i64::from(event.fiducial())))
                .await?;
            self.store
                .set("IMAGE1:ArrayData", ParamValue::Bytes(frame))
                .await?;
            self.store
                .patch_fiducial("IMAGE1:ArrayData", event.fiducial_high)
                .await;
            self.store
                .set("IMAGE1:ArrayData.NORD", ParamValue::Int(elements))
                .await?;
        }
        info!("camera exited acquisition");
        Ok(())
    }

    /// Apply a pending reconfiguration, if any. The flag is cleared even
    /// when the callback fails: a retry would reuse a value snapshot taken
    /// before the failure and risk looping without forward progress.
    pub(crate) async fn maybe_reconfigure(&self) {
        if !self.need_config.load(Ordering::SeqCst) {
            return;
        }
        info!("reconfiguring camera");
        let config = self.config_values().await;
        if let Some(op) = &self.config_op {
            if let Err(err) = op(&config) {
                error!(%err, "reconfiguration callback failed");
            }
        }
        self.need_config.store(false, Ordering::SeqCst);
        info!("reconfigure complete");
    }

    async fn int_param(&self, name: &str) -> AppResult<i64> {
        self.store
            .get(name)
            .await
            .and_then(|value| value.as_i64())
            .ok_or_else(|| CamError::UnknownParameter(name.to_string()))
    }

    async fn float_param(&self, name: &str) -> AppResult<f64> {
        self.store
            .get(name)
            .await
            .and_then(|value| value.as_f64())
            .ok_or_else(|| CamError::UnknownParameter(name.to_string()))
    }
}

/// Simulated frame: `rows x cols` samples from `Normal(offset, scale)`,
/// clamped and cast to the pixel width, packed little-endian. A
/// non-positive spread degenerates to a flat frame at the offset.
fn synthesize_frame(pixel: PixelKind, rows: i64, cols: i64, offset: f64, scale: f64) -> Vec<u8> {
    let count = rows.max(0) as usize * cols.max(0) as usize;
    let mut rng = rand::thread_rng();
    let dist = if scale > 0.0 {
        Normal::new(offset, scale).ok()
    } else {
        None
    };
    let mut out = Vec::with_capacity(count * pixel.byte_width());
    for _ in 0..count {
        let sample = match dist {
            Some(dist) => dist.sample(&mut rng),
            // Degenerate spread: flat frame at the offset
            None => offset,
        };
        match pixel {
            PixelKind::U8 => out.push(sample.clamp(0.0, f64::from(u8::MAX)) as u8),
            PixelKind::U16 => {
                let value = sample.clamp(0.0, f64::from(u16::MAX)) as u16;
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    out
}
