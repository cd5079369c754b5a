//! Typed workflow messages.
//!
//! The engine speaks in a closed set of message types, one schema each.
//! [`MessageType`] is the tag, [`Payload`] the decoded inbound content and
//! [`Response`] the content of a beamline reply. The crystallographic
//! structures are carried as data only; nothing in the bridge interprets them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Token identifying one workflow session end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnactmentId(pub String);

/// Token identifying one request/response exchange within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generates a fresh correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EnactmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol behaviour of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Echoed to the beamline, no reply.
    Info,
    /// Exactly one reply expected before the engine continues.
    Request,
    /// Last message of a session.
    Terminal,
}

/// Tag of an inbound engine message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Free-text progress message.
    String,
    /// An engine subprocess started.
    SubprocessStarted,
    /// The engine subprocess with the same correlation id stopped.
    SubprocessStopped,
    /// Asks for the beamline configuration directory.
    RequestConfiguration,
    /// Asks for sample centring and acquisition parameters for a strategy.
    GeometricStrategy,
    /// Asks the beamline to collect the proposed scans.
    CollectionProposal,
    /// Asks the user to pick an indexing solution.
    ChooseLattice,
    /// Asks for the sample to be centred at one goniostat setting.
    RequestCentring,
    /// Asks for sample metadata known before the experiment.
    ObtainPriorInformation,
    /// Asks the beamline to get ready for centring.
    PrepareForCentring,
    /// The engine gave up.
    WorkflowAborted,
    /// The engine finished successfully.
    WorkflowCompleted,
    /// The engine finished with errors.
    WorkflowFailed,
}

impl MessageType {
    /// Every type, in declaration order.
    pub const ALL: [MessageType; 13] = [
        Self::String,
        Self::SubprocessStarted,
        Self::SubprocessStopped,
        Self::RequestConfiguration,
        Self::GeometricStrategy,
        Self::CollectionProposal,
        Self::ChooseLattice,
        Self::RequestCentring,
        Self::ObtainPriorInformation,
        Self::PrepareForCentring,
        Self::WorkflowAborted,
        Self::WorkflowCompleted,
        Self::WorkflowFailed,
    ];

    /// Wire tag of this type.
    pub fn tag(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::SubprocessStarted => "SubprocessStarted",
            Self::SubprocessStopped => "SubprocessStopped",
            Self::RequestConfiguration => "RequestConfiguration",
            Self::GeometricStrategy => "GeometricStrategy",
            Self::CollectionProposal => "CollectionProposal",
            Self::ChooseLattice => "ChooseLattice",
            Self::RequestCentring => "RequestCentring",
            Self::ObtainPriorInformation => "ObtainPriorInformation",
            Self::PrepareForCentring => "PrepareForCentring",
            Self::WorkflowAborted => "WorkflowAborted",
            Self::WorkflowCompleted => "WorkflowCompleted",
            Self::WorkflowFailed => "WorkflowFailed",
        }
    }

    /// Looks up a wire tag. Engine implementation classes carry an `Impl`
    /// suffix, which is ignored.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.strip_suffix("Impl").unwrap_or(tag);
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Protocol category of this type.
    pub fn category(self) -> MessageCategory {
        match self {
            Self::String | Self::SubprocessStarted | Self::SubprocessStopped => {
                MessageCategory::Info
            }
            Self::WorkflowAborted | Self::WorkflowCompleted | Self::WorkflowFailed => {
                MessageCategory::Terminal
            }
            _ => MessageCategory::Request,
        }
    }

    /// Reply type the engine accepts for a request, `None` for other categories.
    pub fn expected_response(self) -> Option<ResponseType> {
        match self {
            Self::RequestConfiguration => Some(ResponseType::ConfigurationData),
            Self::GeometricStrategy => Some(ResponseType::SampleCentred),
            Self::CollectionProposal => Some(ResponseType::CollectionDone),
            Self::ChooseLattice => Some(ResponseType::SelectedLattice),
            Self::RequestCentring => Some(ResponseType::CentringDone),
            Self::ObtainPriorInformation => Some(ResponseType::PriorInformation),
            Self::PrepareForCentring => Some(ResponseType::ReadyForCentring),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Tag of an outbound beamline reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    /// Reply to `RequestConfiguration`.
    ConfigurationData,
    /// Reply to `GeometricStrategy`.
    SampleCentred,
    /// Reply to `CollectionProposal`.
    CollectionDone,
    /// Reply to `ChooseLattice`.
    SelectedLattice,
    /// Reply to `RequestCentring`.
    CentringDone,
    /// Reply to `ObtainPriorInformation`.
    PriorInformation,
    /// Reply to `PrepareForCentring`.
    ReadyForCentring,
    /// Tells the engine the beamline has ended the session.
    BeamlineAbort,
}

impl ResponseType {
    /// Wire tag of this reply type.
    pub fn tag(self) -> &'static str {
        match self {
            Self::ConfigurationData => "ConfigurationData",
            Self::SampleCentred => "SampleCentred",
            Self::CollectionDone => "CollectionDone",
            Self::SelectedLattice => "SelectedLattice",
            Self::CentringDone => "CentringDone",
            Self::PriorInformation => "PriorInformation",
            Self::ReadyForCentring => "ReadyForCentring",
            Self::BeamlineAbort => "BeamlineAbort",
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// Decoded content of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `String` message.
    Text(TextInfo),
    /// `SubprocessStarted` message.
    SubprocessStarted(SubprocessStarted),
    /// `SubprocessStopped` message.
    SubprocessStopped,
    /// `RequestConfiguration` request.
    RequestConfiguration,
    /// `GeometricStrategy` request.
    GeometricStrategy(GeometricStrategy),
    /// `CollectionProposal` request.
    CollectionProposal(CollectionProposal),
    /// `ChooseLattice` request.
    ChooseLattice(ChooseLattice),
    /// `RequestCentring` request.
    RequestCentring(RequestCentring),
    /// `ObtainPriorInformation` request.
    ObtainPriorInformation,
    /// `PrepareForCentring` request.
    PrepareForCentring,
    /// Terminal `WorkflowAborted`.
    WorkflowAborted(WorkflowDone),
    /// Terminal `WorkflowCompleted`.
    WorkflowCompleted(WorkflowDone),
    /// Terminal `WorkflowFailed`.
    WorkflowFailed(WorkflowDone),
}

impl Payload {
    /// Tag this payload was decoded for.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text(_) => MessageType::String,
            Self::SubprocessStarted(_) => MessageType::SubprocessStarted,
            Self::SubprocessStopped => MessageType::SubprocessStopped,
            Self::RequestConfiguration => MessageType::RequestConfiguration,
            Self::GeometricStrategy(_) => MessageType::GeometricStrategy,
            Self::CollectionProposal(_) => MessageType::CollectionProposal,
            Self::ChooseLattice(_) => MessageType::ChooseLattice,
            Self::RequestCentring(_) => MessageType::RequestCentring,
            Self::ObtainPriorInformation => MessageType::ObtainPriorInformation,
            Self::PrepareForCentring => MessageType::PrepareForCentring,
            Self::WorkflowAborted(_) => MessageType::WorkflowAborted,
            Self::WorkflowCompleted(_) => MessageType::WorkflowCompleted,
            Self::WorkflowFailed(_) => MessageType::WorkflowFailed,
        }
    }
}

/// Free-text info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextInfo {
    /// Message text.
    pub text: String,
}

/// Start notice of an engine subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessStarted {
    /// Display name, echoed again when the subprocess stops.
    pub name: String,
}

/// Motor positions keyed by axis role name.
pub type AxisSettings = BTreeMap<String, f64>;

/// Goniostat, detector or beamstop position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionerSetting {
    /// Setting id, referenced by replies.
    pub id: Uuid,
    /// Axis positions.
    #[serde(default)]
    pub axis_settings: AxisSettings,
}

/// Goniostat setting a sweep starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoniostatSweepSetting {
    /// Setting id.
    pub id: Uuid,
    /// Axis rotated during the sweep.
    pub scan_axis: String,
    /// Positions of the other axes.
    #[serde(default)]
    pub axis_settings: AxisSettings,
}

/// Beam energy setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeamSetting {
    /// Setting id.
    pub id: Uuid,
    /// Wavelength in Å.
    pub wavelength: f64,
}

/// One continuous rotation of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sweep {
    /// Sweep id, referenced by scans.
    pub id: Uuid,
    /// Goniostat start position.
    #[serde(default)]
    pub goniostat_sweep_setting: Option<GoniostatSweepSetting>,
    /// Detector position.
    #[serde(default)]
    pub detector_setting: Option<PositionerSetting>,
    /// Beam energy.
    #[serde(default)]
    pub beam_setting: Option<BeamSetting>,
    /// Beamstop position.
    #[serde(default)]
    pub beamstop_setting: Option<PositionerSetting>,
    /// Start angle in degrees.
    pub start: f64,
    /// Rotation width in degrees.
    pub width: f64,
    /// Sweeps sharing a group are collected together.
    #[serde(default)]
    pub sweep_group: Option<String>,
}

/// Acquisition strategy proposed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometricStrategy {
    /// Strategy id.
    pub id: Uuid,
    /// Whether sweeps are interleaved during collection.
    pub is_interleaved: bool,
    /// Whether the user may edit the parameters.
    pub is_user_modifiable: bool,
    /// Image widths the user may choose from.
    #[serde(default)]
    pub allowed_widths: Vec<f64>,
    /// Index into `allowed_widths` of the default choice.
    #[serde(default)]
    pub default_width_idx: Option<usize>,
    /// Sweeps making up the strategy.
    pub sweeps: Vec<Sweep>,
}

impl GeometricStrategy {
    /// Sweep with the given id.
    pub fn sweep(&self, id: &Uuid) -> Option<&Sweep> {
        self.sweeps.iter().find(|s| &s.id == id)
    }
}

/// Image width and count of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanWidth {
    /// Setting id.
    pub id: Uuid,
    /// Rotation per image in degrees.
    pub image_width: f64,
    /// Number of images.
    pub num_images: u32,
}

/// Exposure of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanExposure {
    /// Setting id.
    pub id: Uuid,
    /// Exposure time per image in seconds.
    pub time: f64,
    /// Beam transmission in percent.
    pub transmission: f64,
}

/// One scan to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    /// Scan id.
    pub id: Uuid,
    /// Image width and count.
    pub width: ScanWidth,
    /// Exposure settings.
    pub exposure: ScanExposure,
    /// Number of the first image.
    pub image_start_num: u32,
    /// Start angle in degrees.
    pub start: f64,
    /// Sweep of the enclosing proposal's strategy this scan belongs to.
    pub sweep_id: Uuid,
    /// Parameters for building image file names.
    #[serde(default)]
    pub filename_params: BTreeMap<String, String>,
}

/// Scans the engine proposes to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProposal {
    /// Proposal id, echoed in `CollectionDone`.
    pub id: Uuid,
    /// Image directory relative to the session root.
    pub relative_image_dir: String,
    /// Strategy the scans belong to.
    pub strategy: GeometricStrategy,
    /// Scans to collect.
    pub scans: Vec<Scan>,
}

impl CollectionProposal {
    /// Returns the id of the first scan whose sweep is not part of the strategy.
    pub fn dangling_scan(&self) -> Option<Uuid> {
        self.scans
            .iter()
            .find(|scan| self.strategy.sweep(&scan.sweep_id).is_none())
            .map(|scan| scan.id)
    }
}

/// Indexing solutions to choose from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChooseLattice {
    /// Format of `solutions`.
    pub format: String,
    /// Solutions as printed by the indexing program.
    pub solutions: String,
    /// Lattices the engine suggests.
    #[serde(default)]
    pub lattices: Vec<String>,
}

/// Centring request for one goniostat setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCentring {
    /// 1-based number of this setting.
    pub current_setting_no: u32,
    /// Number of settings to centre in total.
    pub total_rotations: u32,
    /// Goniostat rotation to centre at.
    #[serde(default)]
    pub goniostat_rotation: Option<PositionerSetting>,
}

/// Problem reported with a terminal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Engine component reporting the issue.
    pub component: String,
    /// Description.
    pub message: String,
    /// Optional numeric code.
    #[serde(default)]
    pub code: Option<i64>,
}

/// Payload shared by the three terminal messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowDone {
    /// Issues reported by the engine.
    #[serde(default)]
    pub issues: Vec<Issue>,
}

// ============================================================================
// Outbound responses
// ============================================================================

/// Content of a beamline reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Configuration directory.
    ConfigurationData(ConfigurationData),
    /// Acquisition parameters after centring.
    SampleCentred(SampleCentred),
    /// Collection result.
    CollectionDone(CollectionDone),
    /// Chosen indexing solution.
    SelectedLattice(SelectedLattice),
    /// Centring result.
    CentringDone(CentringDone),
    /// Sample metadata.
    PriorInformation(PriorInformation),
    /// Acknowledges `PrepareForCentring`.
    ReadyForCentring(Empty),
    /// Session ended by the beamline.
    BeamlineAbort(Empty),
}

impl Response {
    /// Tag of this reply.
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::ConfigurationData(_) => ResponseType::ConfigurationData,
            Self::SampleCentred(_) => ResponseType::SampleCentred,
            Self::CollectionDone(_) => ResponseType::CollectionDone,
            Self::SelectedLattice(_) => ResponseType::SelectedLattice,
            Self::CentringDone(_) => ResponseType::CentringDone,
            Self::PriorInformation(_) => ResponseType::PriorInformation,
            Self::ReadyForCentring(_) => ResponseType::ReadyForCentring,
            Self::BeamlineAbort(_) => ResponseType::BeamlineAbort,
        }
    }

    /// `BeamlineAbort` reply.
    pub fn beamline_abort() -> Self {
        Self::BeamlineAbort(Empty {})
    }

    /// `ReadyForCentring` reply.
    pub fn ready_for_centring() -> Self {
        Self::ReadyForCentring(Empty {})
    }
}

/// Payload of replies that carry no data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Empty {}

/// Beamline configuration location.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationData {
    /// Directory holding the beamline configuration files.
    pub location: PathBuf,
}

/// Translation found by centring at one rotation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoniostatTranslation {
    /// Translation id.
    pub id: Uuid,
    /// Rotation setting the translation belongs to.
    pub requested_rotation_id: Uuid,
    /// Translation axis positions.
    pub axis_settings: AxisSettings,
    /// Rotation actually used, when it differs from the requested one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_rotation: Option<PositionerSetting>,
}

/// Acquisition parameters chosen for a strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleCentred {
    /// Rotation per image in degrees.
    pub image_width: f64,
    /// Exposure time per image in seconds.
    pub exposure: f64,
    /// Beam transmission in percent.
    pub transmission: f64,
    /// Images per wedge for interleaved collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wedge_width: Option<u32>,
    /// Interleave order of the sweeps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interleave_order: Option<String>,
    /// Beamstop position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beamstop_setting: Option<PositionerSetting>,
    /// One translation per centred rotation.
    pub goniostat_translations: Vec<GoniostatTranslation>,
}

/// Result of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDone {
    /// Proposal that was collected.
    pub proposal_id: Uuid,
    /// Directory the images were written to.
    pub image_root: String,
    /// Zero on success.
    pub status: i32,
}

/// Indexing solution picked by the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedLattice {
    /// Format of `solution`.
    pub format: String,
    /// The chosen solution.
    pub solution: String,
}

/// Whether more centring requests follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CentringStatus {
    /// More settings to centre.
    Next,
    /// Last setting centred.
    Done,
}

/// Result of one centring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CentringDone {
    /// Whether more settings follow.
    pub status: CentringStatus,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Translation found, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goniostat_translation: Option<GoniostatTranslation>,
}

/// Unit cell parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCell {
    /// a, b and c in Å.
    pub lengths: [f64; 3],
    /// α, β and γ in degrees.
    pub angles: [f64; 3],
}

/// Element expected to scatter anomalously.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalousScatterer {
    /// Element symbol.
    pub element: String,
    /// Absorption edge, e.g. `K`.
    pub edge: String,
}

/// Wavelength requested for phasing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasingWavelength {
    /// Wavelength id.
    pub id: Uuid,
    /// Wavelength in Å.
    pub wavelength: f64,
    /// Role such as peak or remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Sample knowledge entered by the user.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProvidedInfo {
    /// Anomalous scatterers.
    pub scatterers: Vec<AnomalousScatterer>,
    /// Expected crystal lattice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lattice: Option<String>,
    /// Expected space group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_group: Option<String>,
    /// Expected unit cell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell: Option<UnitCell>,
    /// Expected resolution in Å.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_resolution: Option<f64>,
    /// Whether diffraction is expected to be anisotropic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_anisotropic: Option<bool>,
    /// Wavelengths for phasing.
    pub phasing_wavelengths: Vec<PhasingWavelength>,
}

/// Sample metadata for `ObtainPriorInformation`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorInformation {
    /// Sample id.
    pub sample_id: Uuid,
    /// Sample name, used in file names.
    pub sample_name: String,
    /// Root directory for the session data.
    pub root_directory: PathBuf,
    /// Extra knowledge entered by the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_provided_info: Option<UserProvidedInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip_and_impl_suffix() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(
            MessageType::from_tag("GeometricStrategyImpl"),
            Some(MessageType::GeometricStrategy)
        );
        assert_eq!(MessageType::from_tag("ChooseSpaceGroup"), None);
    }

    #[test]
    fn test_categories() {
        let requests: Vec<_> = MessageType::ALL
            .into_iter()
            .filter(|t| t.category() == MessageCategory::Request)
            .collect();
        assert_eq!(requests.len(), 7);
        assert!(requests.iter().all(|t| t.expected_response().is_some()));
        assert_eq!(MessageType::SubprocessStopped.category(), MessageCategory::Info);
        assert_eq!(MessageType::WorkflowFailed.category(), MessageCategory::Terminal);
        assert_eq!(MessageType::String.expected_response(), None);
    }

    #[test]
    fn test_dangling_scan_detected() {
        let sweep_id = Uuid::new_v4();
        let strategy = GeometricStrategy {
            id: Uuid::new_v4(),
            is_interleaved: false,
            is_user_modifiable: true,
            allowed_widths: vec![0.1, 0.2],
            default_width_idx: Some(0),
            sweeps: vec![Sweep {
                id: sweep_id,
                goniostat_sweep_setting: None,
                detector_setting: None,
                beam_setting: None,
                beamstop_setting: None,
                start: 0.0,
                width: 180.0,
                sweep_group: None,
            }],
        };
        let scan = |sweep: Uuid| Scan {
            id: Uuid::new_v4(),
            width: ScanWidth { id: Uuid::new_v4(), image_width: 0.1, num_images: 1800 },
            exposure: ScanExposure { id: Uuid::new_v4(), time: 0.04, transmission: 50.0 },
            image_start_num: 1,
            start: 0.0,
            sweep_id: sweep,
            filename_params: BTreeMap::new(),
        };
        let mut proposal = CollectionProposal {
            id: Uuid::new_v4(),
            relative_image_dir: "run_01".into(),
            strategy,
            scans: vec![scan(sweep_id)],
        };
        assert_eq!(proposal.dangling_scan(), None);

        let stray = scan(Uuid::new_v4());
        let stray_id = stray.id;
        proposal.scans.push(stray);
        assert_eq!(proposal.dangling_scan(), Some(stray_id));
    }

    #[test]
    fn test_response_serialization_is_untagged_camel_case() {
        let reply = Response::CollectionDone(CollectionDone {
            proposal_id: Uuid::nil(),
            image_root: "/data/run_01".into(),
            status: 0,
        });
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["imageRoot"], "/data/run_01");
        assert_eq!(json["status"], 0);
        assert_eq!(serde_json::to_value(Response::beamline_abort()).unwrap(), serde_json::json!({}));
    }
}
