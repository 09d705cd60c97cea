//! Hardware decode back-end selection.
//!
//! Direct3D 12 and then Direct3D 11 are tried first whenever the platform lists them, without
//! consulting the codec. After that, selection walks the codec's hardware configurations in
//! codec order and keeps the first back-end whose device context actually initializes.
//! Software decoding is the ordinary outcome when nothing matches, not an error.

use std::any::Any;
use std::fmt;

use anyhow::Result;

use crate::media::CodecId;

/// Platform hardware decode back-ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HwDeviceType {
    Vdpau,
    Cuda,
    Vaapi,
    Dxva2,
    Qsv,
    VideoToolbox,
    D3d11va,
    Drm,
    OpenCl,
    MediaCodec,
    Vulkan,
    D3d12va,
}

impl HwDeviceType {
    pub const ALL: [HwDeviceType; 12] = [
        HwDeviceType::Vdpau,
        HwDeviceType::Cuda,
        HwDeviceType::Vaapi,
        HwDeviceType::Dxva2,
        HwDeviceType::Qsv,
        HwDeviceType::VideoToolbox,
        HwDeviceType::D3d11va,
        HwDeviceType::Drm,
        HwDeviceType::OpenCl,
        HwDeviceType::MediaCodec,
        HwDeviceType::Vulkan,
        HwDeviceType::D3d12va,
    ];

    /// Conventional lower-case name (`cuda`, `d3d11va`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            HwDeviceType::Vdpau => "vdpau",
            HwDeviceType::Cuda => "cuda",
            HwDeviceType::Vaapi => "vaapi",
            HwDeviceType::Dxva2 => "dxva2",
            HwDeviceType::Qsv => "qsv",
            HwDeviceType::VideoToolbox => "videotoolbox",
            HwDeviceType::D3d11va => "d3d11va",
            HwDeviceType::Drm => "drm",
            HwDeviceType::OpenCl => "opencl",
            HwDeviceType::MediaCodec => "mediacodec",
            HwDeviceType::Vulkan => "vulkan",
            HwDeviceType::D3d12va => "d3d12va",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

}

/// Back-ends tried before the codec's own list, with the surface format they decode to.
const PLATFORM_PREFERRED: [(HwDeviceType, &str); 2] = [
    (HwDeviceType::D3d12va, "d3d12"),
    (HwDeviceType::D3d11va, "d3d11"),
];

impl fmt::Display for HwDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One hardware configuration a codec advertises.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwConfig {
    pub device_type: HwDeviceType,
    /// Pixel format the decoder emits when this back-end is active.
    pub pixel_format: String,
    /// Whether the config can be driven through a device context.
    pub supports_device_ctx: bool,
}

/// An initialized device context, ready to be attached to a video decoder.
pub struct HwDevice {
    pub device_type: HwDeviceType,
    pub pixel_format: String,
    handle: Box<dyn Any + Send + Sync>,
}

impl HwDevice {
    pub fn new(
        device_type: HwDeviceType,
        pixel_format: impl Into<String>,
        handle: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            device_type,
            pixel_format: pixel_format.into(),
            handle,
        }
    }

    /// Backend-specific handle (e.g. a device buffer reference).
    pub fn handle<T: 'static>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for HwDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwDevice")
            .field("device_type", &self.device_type)
            .field("pixel_format", &self.pixel_format)
            .finish_non_exhaustive()
    }
}

/// Hardware surface of a media backend.
pub trait HwPlatform: Send + Sync {
    /// Back-ends compiled into the platform library, in enumeration order.
    fn device_types(&self) -> Vec<HwDeviceType>;

    /// Hardware configurations the decoder for `codec` advertises, in codec order.
    fn codec_configs(&self, codec: &CodecId) -> Vec<HwConfig>;

    /// Create a device context. Fails when the driver or device is missing.
    fn create_device(&self, device_type: HwDeviceType, pixel_format: &str) -> Result<HwDevice>;
}

/// Outcome of hardware selection.
#[derive(Debug)]
pub enum HwSelection {
    Software,
    Hardware(HwDevice),
}

impl HwSelection {
    pub fn backend_name(&self) -> &'static str {
        match self {
            HwSelection::Software => "software",
            HwSelection::Hardware(device) => device.device_type.name(),
        }
    }

    pub fn device(&self) -> Option<&HwDevice> {
        match self {
            HwSelection::Software => None,
            HwSelection::Hardware(device) => Some(device),
        }
    }
}

/// Picks a hardware back-end for one video stream.
pub struct HwSelector<'a> {
    platform: &'a dyn HwPlatform,
    cuda_max_width: u32,
}

impl<'a> HwSelector<'a> {
    pub fn new(platform: &'a dyn HwPlatform, cuda_max_width: u32) -> Self {
        Self {
            platform,
            cuda_max_width,
        }
    }

    /// Select a back-end for `codec` at `width` pixels.
    pub fn select(&self, codec: &CodecId, width: u32) -> HwSelection {
        let mut available = self.platform.device_types();
        if available.is_empty() {
            tracing::info!(codec = %codec, "no hardware decode back-ends compiled in");
            return HwSelection::Software;
        }

        for (device_type, pixel_format) in PLATFORM_PREFERRED {
            if !available.contains(&device_type) {
                continue;
            }
            match self.platform.create_device(device_type, pixel_format) {
                Ok(device) => {
                    tracing::info!(
                        backend = %device_type,
                        pixel_format,
                        codec = %codec,
                        "hardware decoding enabled"
                    );
                    return HwSelection::Hardware(device);
                }
                Err(err) => {
                    tracing::warn!(backend = %device_type, "device init failed: {err:#}");
                    available.retain(|t| *t != device_type);
                }
            }
        }

        let candidates = self
            .platform
            .codec_configs(codec)
            .into_iter()
            .filter(|cfg| cfg.supports_device_ctx && !cfg.pixel_format.is_empty());

        for cfg in candidates {
            if !available.contains(&cfg.device_type) {
                continue;
            }
            if let Some(reason) = self.incompatibility(cfg.device_type, width) {
                tracing::info!(
                    backend = %cfg.device_type,
                    width,
                    reason,
                    "skipping hardware back-end"
                );
                continue;
            }
            match self
                .platform
                .create_device(cfg.device_type, &cfg.pixel_format)
            {
                Ok(device) => {
                    tracing::info!(
                        backend = %cfg.device_type,
                        pixel_format = %cfg.pixel_format,
                        codec = %codec,
                        "hardware decoding enabled"
                    );
                    return HwSelection::Hardware(device);
                }
                Err(err) => {
                    tracing::warn!(backend = %cfg.device_type, "device init failed: {err:#}");
                    available.retain(|t| *t != cfg.device_type);
                }
            }
        }

        tracing::info!(codec = %codec, "falling back to software decoding");
        HwSelection::Software
    }

    fn incompatibility(&self, device_type: HwDeviceType, width: u32) -> Option<&'static str> {
        if device_type == HwDeviceType::Cuda && width > self.cuda_max_width {
            return Some("frame width above decoder limit");
        }
        None
    }
}

/// Names of back-ends whose device context can be created on this machine.
pub fn available_devices(platform: &dyn HwPlatform) -> Vec<String> {
    platform
        .device_types()
        .into_iter()
        .filter(|t| match platform.create_device(*t, "") {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(backend = %t, "device unavailable: {err:#}");
                false
            }
        })
        .map(|t| t.name().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anyhow::anyhow;

    struct FakePlatform {
        types: Vec<HwDeviceType>,
        configs: Vec<HwConfig>,
        working: Vec<HwDeviceType>,
        attempts: Mutex<Vec<HwDeviceType>>,
    }

    impl FakePlatform {
        fn new(types: &[HwDeviceType], configs: &[HwDeviceType], working: &[HwDeviceType]) -> Self {
            Self {
                types: types.to_vec(),
                configs: configs
                    .iter()
                    .map(|t| HwConfig {
                        device_type: *t,
                        pixel_format: format!("{}_surface", t.name()),
                        supports_device_ctx: true,
                    })
                    .collect(),
                working: working.to_vec(),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    impl HwPlatform for FakePlatform {
        fn device_types(&self) -> Vec<HwDeviceType> {
            self.types.clone()
        }

        fn codec_configs(&self, _codec: &CodecId) -> Vec<HwConfig> {
            self.configs.clone()
        }

        fn create_device(&self, device_type: HwDeviceType, pixel_format: &str) -> Result<HwDevice> {
            self.attempts.lock().unwrap().push(device_type);
            if self.working.contains(&device_type) {
                Ok(HwDevice::new(device_type, pixel_format, Box::new(())))
            } else {
                Err(anyhow!("no {device_type} driver"))
            }
        }
    }

    fn h264() -> CodecId {
        CodecId::new("h264")
    }

    #[test]
    fn no_platform_backends_means_software() {
        let platform = FakePlatform::new(&[], &[HwDeviceType::Cuda], &[HwDeviceType::Cuda]);
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 1920);
        assert!(matches!(sel, HwSelection::Software));
    }

    #[test]
    fn first_working_backend_in_codec_order_wins() {
        let types = [HwDeviceType::Vdpau, HwDeviceType::Cuda, HwDeviceType::Vaapi];
        let platform = FakePlatform::new(&types, &types, &[HwDeviceType::Cuda, HwDeviceType::Vaapi]);
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 1920);
        assert_eq!(sel.backend_name(), "cuda");
        assert_eq!(
            *platform.attempts.lock().unwrap(),
            vec![HwDeviceType::Vdpau, HwDeviceType::Cuda]
        );
    }

    #[test]
    fn direct3d_backends_are_preferred() {
        let types = [HwDeviceType::Dxva2, HwDeviceType::D3d11va, HwDeviceType::D3d12va];
        let platform = FakePlatform::new(&types, &types, &types);
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 1920);
        assert_eq!(sel.backend_name(), "d3d12va");
    }

    #[test]
    fn direct3d_is_tried_even_when_the_codec_does_not_list_it() {
        let platform = FakePlatform::new(
            &[HwDeviceType::Cuda, HwDeviceType::D3d11va],
            &[HwDeviceType::Cuda],
            &[HwDeviceType::Cuda, HwDeviceType::D3d11va],
        );
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 1920);
        assert_eq!(sel.backend_name(), "d3d11va");
        assert_eq!(sel.device().unwrap().pixel_format, "d3d11");
        assert_eq!(*platform.attempts.lock().unwrap(), vec![HwDeviceType::D3d11va]);
    }

    #[test]
    fn failed_direct3d_falls_through_to_codec_order() {
        let types = [HwDeviceType::D3d12va, HwDeviceType::D3d11va, HwDeviceType::Vaapi];
        let platform = FakePlatform::new(&types, &types, &[HwDeviceType::Vaapi]);
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 1920);
        assert_eq!(sel.backend_name(), "vaapi");
        // Each Direct3D device is attempted once, not again from the codec list.
        assert_eq!(
            *platform.attempts.lock().unwrap(),
            vec![HwDeviceType::D3d12va, HwDeviceType::D3d11va, HwDeviceType::Vaapi]
        );
    }

    #[test]
    fn cuda_is_skipped_above_width_limit() {
        let types = [HwDeviceType::Cuda, HwDeviceType::Vaapi];
        let platform = FakePlatform::new(&types, &types, &types);
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 3840);
        assert_eq!(sel.backend_name(), "vaapi");
        assert!(!platform.attempts.lock().unwrap().contains(&HwDeviceType::Cuda));
    }

    #[test]
    fn codec_configs_outside_platform_list_are_ignored() {
        let platform = FakePlatform::new(
            &[HwDeviceType::Vaapi],
            &[HwDeviceType::Cuda, HwDeviceType::Vaapi],
            &[HwDeviceType::Cuda, HwDeviceType::Vaapi],
        );
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 640);
        assert_eq!(sel.backend_name(), "vaapi");
    }

    #[test]
    fn all_failures_fall_back_to_software() {
        let types = [HwDeviceType::Cuda, HwDeviceType::Vaapi];
        let platform = FakePlatform::new(&types, &types, &[]);
        let sel = HwSelector::new(&platform, 2032).select(&h264(), 640);
        assert!(sel.device().is_none());
        assert_eq!(sel.backend_name(), "software");
    }

    #[test]
    fn available_devices_lists_only_creatable() {
        let types = [HwDeviceType::Cuda, HwDeviceType::Vaapi, HwDeviceType::Vulkan];
        let platform = FakePlatform::new(&types, &[], &[HwDeviceType::Vaapi]);
        assert_eq!(available_devices(&platform), vec!["vaapi".to_string()]);
    }

    #[test]
    fn device_type_names_roundtrip() {
        for t in HwDeviceType::ALL {
            assert_eq!(HwDeviceType::from_name(t.name()), Some(t));
        }
        assert_eq!(HwDeviceType::from_name(" CUDA "), Some(HwDeviceType::Cuda));
        assert_eq!(HwDeviceType::from_name("nope"), None);
    }
}
