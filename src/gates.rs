//! Virtual gate mapping façade.
//!
//! A [`VirtualDac`] translates logical gate names (`"P1"`, `"L"`, `"SD1a"`) into
//! `(instrument, channel)` pairs on one or more [`DacInstrument`]s and forwards
//! reads and writes to them. On top of the plain mapping it keeps per-gate
//! boundaries, which are validated on every write and mirrored onto the backing
//! instrument channel.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use qdot_tuning::gates::{ChannelRef, GateMap, VirtualDac};
//! use qdot_tuning::instrument::VirtualIvvi;
//!
//! # fn main() -> qdot_tuning::error::AppResult<()> {
//! let ivvi = Arc::new(VirtualIvvi::new("ivvi"));
//! let mut map = GateMap::new();
//! map.insert("P1".into(), ChannelRef::index(0, 3));
//! map.insert("P2".into(), ChannelRef::named("ivvi", 4));
//!
//! let gates = VirtualDac::new("gates", vec![ivvi], map);
//! gates.set_boundaries([("P1", (-500.0, 0.0))])?;
//!
//! gates.with_restore(|g| {
//!     g.set("P1", -250.0)?;
//!     assert_eq!(g.get("P1")?, -250.0);
//!     Ok(())
//! })?;
//! assert_eq!(gates.get("P1")?, 0.0);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::boundary::Boundary;
use crate::error::{AppResult, TuningError};
use crate::instrument::DacInstrument;
use crate::sweep::SweepValues;

// =============================================================================
// Gate map types
// =============================================================================

/// Reference to a backing instrument, by position or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstrumentKey {
    /// Position in the instrument list of the virtual DAC
    Index(usize),
    /// Instrument name
    Name(String),
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKey::Index(idx) => write!(f, "#{idx}"),
            InstrumentKey::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Instrument channel a gate is mapped to.
///
/// Serialized as a `[instrument, channel]` pair, e.g. `[0, 3]` or `["ivvi", 3]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(InstrumentKey, u32)", into = "(InstrumentKey, u32)")]
pub struct ChannelRef {
    /// Backing instrument
    pub instrument: InstrumentKey,
    /// Channel number on that instrument
    pub channel: u32,
}

impl ChannelRef {
    /// Channel on the instrument at position `idx`.
    pub fn index(idx: usize, channel: u32) -> Self {
        Self {
            instrument: InstrumentKey::Index(idx),
            channel,
        }
    }

    /// Channel on the instrument called `name`.
    pub fn named(name: impl Into<String>, channel: u32) -> Self {
        Self {
            instrument: InstrumentKey::Name(name.into()),
            channel,
        }
    }
}

impl From<(InstrumentKey, u32)> for ChannelRef {
    fn from((instrument, channel): (InstrumentKey, u32)) -> Self {
        Self {
            instrument,
            channel,
        }
    }
}

impl From<ChannelRef> for (InstrumentKey, u32) {
    fn from(value: ChannelRef) -> Self {
        (value.instrument, value.channel)
    }
}

/// Mapping from gate name to instrument channel.
pub type GateMap = BTreeMap<String, ChannelRef>;

// =============================================================================
// Gate state
// =============================================================================

struct DacState {
    instruments: Vec<Arc<dyn DacInstrument>>,
    gate_map: GateMap,
    boundaries: BTreeMap<String, Boundary>,
}

impl DacState {
    fn resolve(&self, dac: &str, gate: &str) -> AppResult<(Arc<dyn DacInstrument>, u32)> {
        resolve_in(&self.instruments, &self.gate_map, dac, gate)
    }

    fn mirror_bounds(&self, dac: &str, gate: &str, bounds: Option<Boundary>) -> AppResult<()> {
        let (instrument, channel) = self.resolve(dac, gate)?;
        instrument.set_channel_bounds(channel, bounds)
    }
}

/// Resolve `gate` against `gate_map` and check that the channel exists.
fn resolve_in(
    instruments: &[Arc<dyn DacInstrument>],
    gate_map: &GateMap,
    dac: &str,
    gate: &str,
) -> AppResult<(Arc<dyn DacInstrument>, u32)> {
    let channel_ref = gate_map
        .get(gate)
        .ok_or_else(|| TuningError::unknown_gate(dac, gate))?;

    let instrument = match &channel_ref.instrument {
        InstrumentKey::Index(idx) => instruments.get(*idx),
        InstrumentKey::Name(name) => instruments.iter().find(|i| i.name() == name),
    }
    .ok_or_else(|| TuningError::UnknownInstrument(channel_ref.instrument.to_string()))?;

    Ok((Arc::clone(instrument), channel_ref.channel))
}

/// Resolved channel plus the bounds to put on it
type BoundsUpdate = (Arc<dyn DacInstrument>, u32, Option<Boundary>);

fn apply_bounds(updates: &[BoundsUpdate]) -> AppResult<()> {
    for (instrument, channel, bounds) in updates {
        instrument.set_channel_bounds(*channel, *bounds)?;
    }
    Ok(())
}

// =============================================================================
// VirtualDac
// =============================================================================

/// Gate-mapping façade over a set of DAC instruments.
///
/// All methods take `&self`; the façade is shared as `Arc<VirtualDac>` between
/// the station, detectors and background measurements.
pub struct VirtualDac {
    name: String,
    state: RwLock<DacState>,
}

impl fmt::Debug for VirtualDac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("VirtualDac")
            .field("name", &self.name)
            .field(
                "instruments",
                &state.instruments.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .field("gate_map", &state.gate_map)
            .field("boundaries", &state.boundaries)
            .finish()
    }
}

impl VirtualDac {
    /// Create a façade over `instruments` with the given gate map.
    pub fn new(
        name: impl Into<String>,
        instruments: Vec<Arc<dyn DacInstrument>>,
        gate_map: GateMap,
    ) -> Self {
        let name = name.into();
        info!(dac = %name, gates = gate_map.len(), "Creating virtual DAC");
        Self {
            name,
            state: RwLock::new(DacState {
                instruments,
                gate_map,
                boundaries: BTreeMap::new(),
            }),
        }
    }

    /// Name of the façade
    pub fn name(&self) -> &str {
        &self.name
    }

    // -------------------------------------------------------------------------
    // Gate map
    // -------------------------------------------------------------------------

    /// Current gate map
    pub fn gate_map(&self) -> GateMap {
        self.state.read().gate_map.clone()
    }

    /// Replace the gate map.
    ///
    /// Previously mapped names become inaccessible. Boundaries are kept for
    /// names present in both maps and re-applied to their new channels.
    pub fn set_gate_map(&self, gate_map: GateMap) -> AppResult<()> {
        let mut state = self.state.write();

        // Resolve every channel first so a bad map leaves the state untouched.
        let mut cleared: Vec<BoundsUpdate> = Vec::new();
        let mut mirrored: Vec<BoundsUpdate> = Vec::new();
        let mut kept = BTreeMap::new();
        for (gate, bounds) in &state.boundaries {
            let (instrument, channel) = state.resolve(&self.name, gate)?;
            cleared.push((instrument, channel, None));
            if gate_map.contains_key(gate) {
                let (instrument, channel) =
                    resolve_in(&state.instruments, &gate_map, &self.name, gate)?;
                instrument.channel_bounds(channel)?;
                mirrored.push((instrument, channel, Some(*bounds)));
                kept.insert(gate.clone(), *bounds);
            }
        }

        apply_bounds(&cleared)?;
        apply_bounds(&mirrored)?;
        let dropped = state.boundaries.len() - kept.len();
        state.gate_map = gate_map;
        state.boundaries = kept;

        info!(dac = %self.name, gates = state.gate_map.len(), dropped_boundaries = dropped, "Gate map replaced");
        Ok(())
    }

    /// Names of all mapped gates
    pub fn gates(&self) -> Vec<String> {
        self.state.read().gate_map.keys().cloned().collect()
    }

    /// Whether `gate` is mapped
    pub fn has_gate(&self, gate: &str) -> bool {
        self.state.read().gate_map.contains_key(gate)
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// Backing instruments, in index order
    pub fn instruments(&self) -> Vec<Arc<dyn DacInstrument>> {
        self.state.read().instruments.clone()
    }

    /// Append instruments that are not registered yet.
    ///
    /// An instrument counts as registered when the same object or an instrument
    /// with the same name is already present, so repeated calls are idempotent.
    pub fn add_instruments(&self, instruments: impl IntoIterator<Item = Arc<dyn DacInstrument>>) {
        let mut state = self.state.write();
        for instrument in instruments {
            let present = state
                .instruments
                .iter()
                .any(|i| Arc::ptr_eq(i, &instrument) || i.name() == instrument.name());
            if present {
                debug!(dac = %self.name, instrument = %instrument.name(), "Instrument already registered");
                continue;
            }
            info!(dac = %self.name, instrument = %instrument.name(), "Adding instrument");
            state.instruments.push(instrument);
        }
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    /// Read a gate value from its instrument channel
    pub fn get(&self, gate: &str) -> AppResult<f64> {
        let (instrument, channel) = self.state.read().resolve(&self.name, gate)?;
        instrument.get_channel(channel)
    }

    /// Write a gate value.
    ///
    /// Fails with [`TuningError::OutOfBounds`] when the value violates the gate
    /// boundary; nothing is written in that case.
    pub fn set(&self, gate: &str, value: f64) -> AppResult<()> {
        let (instrument, channel) = {
            let state = self.state.read();
            if let Some(bounds) = state.boundaries.get(gate) {
                bounds.check(gate, value)?;
            }
            state.resolve(&self.name, gate)?
        };
        debug!(dac = %self.name, gate, value, "Setting gate");
        instrument.set_channel(channel, value)
    }

    /// Change a gate value by `delta`
    pub fn increment(&self, gate: &str, delta: f64) -> AppResult<()> {
        let current = self.get(gate)?;
        self.set(gate, current + delta)
    }

    /// Snapshot of all gate values
    pub fn all_values(&self) -> AppResult<BTreeMap<String, f64>> {
        let gates = self.gates();
        gates
            .into_iter()
            .map(|gate| {
                let value = self.get(&gate)?;
                Ok((gate, value))
            })
            .collect()
    }

    /// Set several gates at once
    pub fn reset_gates(&self, values: &BTreeMap<String, f64>) -> AppResult<()> {
        for (gate, value) in values {
            self.set(gate, *value)?;
        }
        Ok(())
    }

    /// Handle to a single gate
    pub fn parameter(&self, gate: &str) -> AppResult<GateParameter<'_>> {
        if !self.has_gate(gate) {
            return Err(TuningError::unknown_gate(&self.name, gate));
        }
        Ok(GateParameter {
            dac: self,
            gate: gate.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Boundaries
    // -------------------------------------------------------------------------

    /// Boundaries of all gates that have one
    pub fn get_boundaries(&self) -> BTreeMap<String, Boundary> {
        self.state.read().boundaries.clone()
    }

    /// Boundary of a single gate
    pub fn boundary(&self, gate: &str) -> Option<Boundary> {
        self.state.read().boundaries.get(gate).copied()
    }

    /// Set gate boundaries from `(low, high)` pairs.
    ///
    /// Unknown gate names are skipped with a warning. A pair with `low > high`
    /// or a gate whose channel cannot be resolved fails the whole update
    /// before anything is applied.
    pub fn set_boundaries<I, S>(&self, boundaries: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (S, (f64, f64))>,
        S: AsRef<str>,
    {
        let mut state = self.state.write();

        let mut validated = Vec::new();
        for (gate, (low, high)) in boundaries {
            let gate = gate.as_ref();
            if !state.gate_map.contains_key(gate) {
                warn!("{} has no gate {}", self.name, gate);
                continue;
            }
            let bounds = Boundary::for_gate(gate, low, high)?;
            let (instrument, channel) = state.resolve(&self.name, gate)?;
            instrument.channel_bounds(channel)?;
            validated.push((gate.to_string(), instrument, channel, bounds));
        }

        for (gate, instrument, channel, bounds) in validated {
            instrument.set_channel_bounds(channel, Some(bounds))?;
            debug!(dac = %self.name, gate = %gate, low = bounds.low(), high = bounds.high(), "Boundary set");
            state.boundaries.insert(gate, bounds);
        }
        Ok(())
    }

    /// Narrow gate boundaries to their intersection with the given ranges.
    ///
    /// Gates without a boundary take the requested range. Gates not listed
    /// keep their boundary. Disjoint ranges are rejected.
    pub fn restrict_boundaries<I, S>(&self, boundaries: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (S, (f64, f64))>,
        S: AsRef<str>,
    {
        let current = self.get_boundaries();
        let mut restricted = Vec::new();

        for (gate, (low, high)) in boundaries {
            let gate = gate.as_ref();
            let requested = Boundary::for_gate(gate, low, high)?;
            let bounds = match current.get(gate) {
                Some(existing) => {
                    existing
                        .intersect(&requested)
                        .ok_or_else(|| TuningError::InvalidBoundary {
                            gate: gate.to_string(),
                            low: existing.low().max(low),
                            high: existing.high().min(high),
                        })?
                }
                None => requested,
            };
            restricted.push((gate.to_string(), (bounds.low(), bounds.high())));
        }

        self.set_boundaries(restricted)
    }

    // -------------------------------------------------------------------------
    // Scoped restore
    // -------------------------------------------------------------------------

    /// Snapshot gate map, boundaries and values; restore them when the guard drops.
    ///
    /// Restoration runs on normal scope exit, early `?` returns and panics alike.
    pub fn restore_at_exit(&self) -> AppResult<RestoreGuard<'_>> {
        let snapshot = Snapshot {
            gate_map: self.gate_map(),
            boundaries: self.get_boundaries(),
            values: self.all_values()?,
        };
        debug!(dac = %self.name, gates = snapshot.values.len(), "Snapshot taken");
        Ok(RestoreGuard {
            dac: self,
            snapshot: Some(snapshot),
        })
    }

    /// Run `f` and restore the pre-call state afterwards.
    ///
    /// The state is restored before the result of `f` (including its error)
    /// is handed back to the caller. A restore failure is returned when `f`
    /// succeeded and logged when `f` failed.
    pub fn with_restore<T>(&self, f: impl FnOnce(&Self) -> AppResult<T>) -> AppResult<T> {
        let guard = self.restore_at_exit()?;
        let result = f(self);
        match (result, guard.restore()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                warn!(dac = %self.name, error = %restore_err, "Failed to restore gate state");
                Err(e)
            }
        }
    }

    /// Put back the snapshot.
    ///
    /// Values are written straight to the channels without the boundary check,
    /// since a gate may legally sit outside a boundary set after its value.
    /// Every gate is attempted; the first failure is returned and the rest
    /// are logged.
    fn restore(&self, snapshot: Snapshot) -> AppResult<()> {
        let Snapshot {
            gate_map,
            boundaries,
            values,
        } = snapshot;
        let mut state = self.state.write();
        let mut failures = Vec::new();

        for gate in state.boundaries.keys() {
            if !boundaries.contains_key(gate) {
                // gate may have been unmapped inside the scope
                let _ = state.mirror_bounds(&self.name, gate, None);
            }
        }
        state.gate_map = gate_map;
        state.boundaries = boundaries;

        for (gate, value) in &values {
            let written = state
                .resolve(&self.name, gate)
                .and_then(|(instrument, channel)| {
                    instrument.set_channel_bounds(channel, None)?;
                    instrument.set_channel(channel, *value)
                });
            if let Err(e) = written {
                failures.push(e);
            }
        }
        for (gate, bounds) in &state.boundaries {
            if let Err(e) = state.mirror_bounds(&self.name, gate, Some(*bounds)) {
                failures.push(e);
            }
        }
        drop(state);

        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(()),
            Some(first) => {
                for e in failures {
                    warn!(dac = %self.name, error = %e, "Further restore failure");
                }
                Err(first)
            }
        }
    }
}

// =============================================================================
// RestoreGuard
// =============================================================================

struct Snapshot {
    gate_map: GateMap,
    boundaries: BTreeMap<String, Boundary>,
    values: BTreeMap<String, f64>,
}

/// Guard returned by [`VirtualDac::restore_at_exit`].
#[must_use = "the snapshot is restored when the guard is dropped"]
pub struct RestoreGuard<'a> {
    dac: &'a VirtualDac,
    snapshot: Option<Snapshot>,
}

impl RestoreGuard<'_> {
    /// Restore now and report failures instead of logging them.
    pub fn restore(mut self) -> AppResult<()> {
        match self.snapshot.take() {
            Some(snapshot) => self.dac.restore(snapshot),
            None => Ok(()),
        }
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            match self.dac.restore(snapshot) {
                Ok(()) => debug!(dac = %self.dac.name, "Gate state restored"),
                Err(e) => warn!(dac = %self.dac.name, error = %e, "Failed to restore gate state"),
            }
        }
    }
}

// =============================================================================
// GateParameter
// =============================================================================

/// Handle to one gate of a [`VirtualDac`].
#[derive(Debug, Clone)]
pub struct GateParameter<'a> {
    dac: &'a VirtualDac,
    gate: String,
}

impl GateParameter<'_> {
    /// Gate name
    pub fn name(&self) -> &str {
        &self.gate
    }

    /// Current value
    pub fn get(&self) -> AppResult<f64> {
        self.dac.get(&self.gate)
    }

    /// Write a value
    pub fn set(&self, value: f64) -> AppResult<()> {
        self.dac.set(&self.gate, value)
    }

    /// Change the value by `delta`
    pub fn increment(&self, delta: f64) -> AppResult<()> {
        self.dac.increment(&self.gate, delta)
    }

    /// Boundary of this gate
    pub fn boundary(&self) -> Option<Boundary> {
        self.dac.boundary(&self.gate)
    }

    /// Sweep from `start` toward `end` (exclusive) in steps of `|step|`.
    pub fn sweep(&self, start: f64, end: f64, step: f64) -> AppResult<SweepValues> {
        SweepValues::new(&self.gate, start, end, step, self.boundary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::VirtualIvvi;

    fn dac() -> (Arc<VirtualIvvi>, VirtualDac) {
        let ivvi = Arc::new(VirtualIvvi::new("ivvi"));
        let mut map = GateMap::new();
        map.insert("P1".into(), ChannelRef::index(0, 1));
        map.insert("P2".into(), ChannelRef::index(0, 2));
        let dac = VirtualDac::new("gates", vec![ivvi.clone() as Arc<dyn DacInstrument>], map);
        (ivvi, dac)
    }

    #[test]
    fn unresolvable_instrument_is_reported() {
        let (_, dac) = dac();
        let mut map = GateMap::new();
        map.insert("X".into(), ChannelRef::named("missing", 1));
        dac.set_gate_map(map).unwrap();
        assert!(matches!(
            dac.get("X"),
            Err(TuningError::UnknownInstrument(_))
        ));
    }

    #[test]
    fn boundary_blocks_write() {
        let (ivvi, dac) = dac();
        dac.set_boundaries([("P1", (-10.0, 10.0))]).unwrap();
        assert!(dac.set("P1", 20.0).is_err());
        assert_eq!(dac.get("P1").unwrap(), 0.0);
        assert_eq!(
            ivvi.channel_bounds(1).unwrap(),
            Some(Boundary::new(-10.0, 10.0).unwrap())
        );
    }

    #[test]
    fn invalid_pair_applies_nothing() {
        let (_, dac) = dac();
        let result = dac.set_boundaries([("P1", (0.0, 1.0)), ("P2", (2.0, 1.0))]);
        assert!(matches!(result, Err(TuningError::InvalidBoundary { .. })));
        assert!(dac.get_boundaries().is_empty());
    }

    #[test]
    fn gate_map_round_trips_through_json() {
        let mut map = GateMap::new();
        map.insert("P1".into(), ChannelRef::index(0, 3));
        map.insert("P1named".into(), ChannelRef::named("ivvi", 3));
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"P1":[0,3],"P1named":["ivvi",3]}"#);
        let back: GateMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn explicit_restore_reports_result() {
        let (_, dac) = dac();
        let guard = dac.restore_at_exit().unwrap();
        dac.set("P2", 5.0).unwrap();
        guard.restore().unwrap();
        assert_eq!(dac.get("P2").unwrap(), 0.0);
    }
}
