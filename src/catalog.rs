//! Static parameter catalogs for the simulated camera models.
//!
//! The catalog is plain data handed to [`crate::store::ParameterStore`] at
//! construction; nothing here is module-level mutable state. Names follow
//! the areaDetector record conventions so existing client screens keep
//! working against the simulator.

use crate::store::{ParamSpec, ParamValue};

/// Width of one produced pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelKind {
    U8,
    U16,
}

impl PixelKind {
    pub fn from_bits(bits: i64) -> Self {
        if bits <= 8 {
            PixelKind::U8
        } else {
            PixelKind::U16
        }
    }

    pub fn byte_width(self) -> usize {
        match self {
            PixelKind::U8 => 1,
            PixelKind::U16 => 2,
        }
    }
}

/// Fixed description of one supported camera model.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub rows: i64,
    pub cols: i64,
    pub bits: i64,
}

impl CameraModel {
    pub fn pixel_kind(&self) -> PixelKind {
        PixelKind::from_bits(self.bits)
    }
}

/// Look up a supported camera model by its simulator name.
pub fn camera_model(name: &str) -> Option<CameraModel> {
    match name {
        "Opal1k" => Some(CameraModel {
            manufacturer: "Adimec",
            model: "1000m/CL",
            rows: 1024,
            cols: 1024,
            bits: 12,
        }),
        "Pulnix" => Some(CameraModel {
            manufacturer: "Adimec",
            model: "1000m/CL",
            rows: 480,
            cols: 640,
            bits: 10,
        }),
        "Visar" => Some(CameraModel {
            manufacturer: "Hamamatsu",
            model: "CC7700",
            rows: 1024,
            cols: 1344,
            bits: 16,
        }),
        _ => None,
    }
}

/// Parameter table for one camera model, seeded with the construction-time
/// platform and readout-group ids.
pub fn camera_params(model: &CameraModel, platform: u8, readout_group: u8) -> Vec<ParamSpec> {
    let count = model.rows * model.cols;
    vec![
        ParamSpec::new("FIDUCIAL", ParamValue::Int(0xDEADBEEF)).read_only(),
        ParamSpec::new("IMAGE1:ArrayData", ParamValue::Bytes(Vec::new())).read_only(),
        ParamSpec::new("IMAGE1:ArrayData.NORD", ParamValue::Int(count)).read_only(),
        ParamSpec::new("IMAGE1:ArraySize1_RBV", ParamValue::Int(model.rows)).read_only(),
        ParamSpec::new("IMAGE1:ArraySize0_RBV", ParamValue::Int(model.cols)).read_only(),
        ParamSpec::new("IMAGE1:BitsPerPixel_RBV", ParamValue::Int(model.bits)).read_only(),
        ParamSpec::new("Model_RBV", ParamValue::Str(model.model.into())).read_only(),
        ParamSpec::new(
            "Manufacturer_RBV",
            ParamValue::Str(model.manufacturer.into()),
        )
        .read_only(),
        ParamSpec::new("MinX_RBV", ParamValue::Int(0)).durable().config(),
        ParamSpec::new("MinY_RBV", ParamValue::Int(0)).durable().config(),
        ParamSpec::new("SizeX_RBV", ParamValue::Int(model.rows)).durable().config(),
        ParamSpec::new("SizeY_RBV", ParamValue::Int(model.cols)).durable().config(),
        ParamSpec::new("AcquireTime_RBV", ParamValue::Float(0.0)).durable().config(),
        ParamSpec::new("Gain_RBV", ParamValue::Float(0.0)).durable().config(),
        ParamSpec::new("READOUT", ParamValue::Int(i64::from(readout_group))).read_only(),
        ParamSpec::new("PLATFORM", ParamValue::Int(i64::from(platform))).read_only(),
        ParamSpec::new("TIMEOUT", ParamValue::Float(5.0)).durable(),
        ParamSpec::new("OFFSET", ParamValue::Int(100)).durable(),
        ParamSpec::new("SCALE", ParamValue::Int(10)).durable(),
    ]
}

/// Administrative parameters shared by every instance. HEARTBEAT, TOD and
/// STARTTOD are computed on read by the driver; SYSRESET is the registered
/// shutdown command.
pub fn admin_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("HEARTBEAT", ParamValue::Int(0)).read_only(),
        ParamSpec::new("TOD", ParamValue::Str(String::new())).read_only(),
        ParamSpec::new("STARTTOD", ParamValue::Str(String::new())).read_only(),
        ParamSpec::new("SYSRESET", ParamValue::Int(0)).command(),
    ]
}

/// Full catalog for one instance: camera table plus the admin table.
pub fn full_catalog(model: &CameraModel, platform: u8, readout_group: u8) -> Vec<ParamSpec> {
    let mut params = camera_params(model, platform, readout_group);
    params.extend(admin_params());
    params
}
