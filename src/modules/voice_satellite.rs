//! voice-satellite - Wyoming satellite with wake word and LED services
//!
//! Both rhasspy repositories are cloned into the connecting user's home and
//! never pulled. Their Python environments are rebuilt through handlers only
//! when a fresh clone happened, so an existing node is not reinstalled on
//! every run.

use declarative::{CommandSpec, FileSpec, HandlerAction, ModulePlan};
use serde::Deserialize;
use std::time::Duration;

use super::{BuildContext, ConfigError, ProvisionModule, UnitFile, continued, unit_spec};
use crate::resource::{
    AptPackages, Command, Condition, Directory, Download, FileContent, GitRepo, PipPackages,
    ServiceState, quote,
};

const NAME: &str = "voice-satellite";
const SATELLITE_URL: &str = "https://github.com/rhasspy/wyoming-satellite.git";
const OPENWAKEWORD_URL: &str = "https://github.com/rhasspy/wyoming-openwakeword.git";
const PREBUILT_WHEELS: &str = "https://synesthesiam.github.io/prebuilt-apps/";
const SATELLITE_UNIT: &str = "wyoming-satellite.service";
const OPENWAKEWORD_UNIT: &str = "wyoming-openwakeword.service";
const DRIVER_TIMEOUT: Duration = Duration::from_secs(3600);

const SYSTEM_PACKAGES: &[&str] = &[
    "git",
    "python3-venv",
    "libopenblas-dev",
    "python3-spidev",
    "python3-gpiozero",
];
const BASE_PIP: &[&str] = &["pip", "wheel", "setuptools"];

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SatelliteConfig {
    name: String,
    uri: String,
    audio: Audio,
    enhancements: Enhancements,
    wake_word: WakeWord,
    led_service: LedService,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            name: "my satellite".to_string(),
            uri: "tcp://0.0.0.0:10700".to_string(),
            audio: Audio::default(),
            enhancements: Enhancements::default(),
            wake_word: WakeWord::default(),
            led_service: LedService::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Audio {
    mic_device: String,
    speaker_device: String,
}

impl Default for Audio {
    fn default() -> Self {
        Self {
            mic_device: "plughw:CARD=seeed2micvoicec,DEV=0".to_string(),
            speaker_device: "plughw:CARD=seeed2micvoicec,DEV=0".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Enhancements {
    auto_gain: Option<u8>,
    noise_suppression: Option<u8>,
    mic_volume_multiplier: Option<f64>,
    snd_volume_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WakeWord {
    enabled: bool,
    uri: String,
    name: String,
    custom_models: Vec<CustomModel>,
    preload_models: Vec<String>,
}

impl Default for WakeWord {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: "tcp://127.0.0.1:10400".to_string(),
            name: "ok_nabu".to_string(),
            custom_models: Vec::new(),
            preload_models: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CustomModel {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LedService {
    enabled: bool,
    uri: String,
    #[serde(rename = "type")]
    kind: String,
    brightness: u8,
}

impl Default for LedService {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: "tcp://127.0.0.1:10500".to_string(),
            kind: "2mic".to_string(),
            brightness: 15,
        }
    }
}

impl LedService {
    fn unit(&self) -> String {
        format!("{}_leds.service", self.kind)
    }
}

/// Single-quoted `ExecStart=` argument
fn quoted(flag: &str, value: &str) -> String {
    format!("{} '{}'", flag, value)
}

/// Paths under the connecting user's home
struct Layout {
    satellite: String,
    openwakeword: String,
    examples: String,
    wake_words: String,
}

impl Layout {
    fn new(home: &str) -> Self {
        let satellite = format!("{}/wyoming-satellite", home);
        Self {
            examples: format!("{}/examples", satellite),
            openwakeword: format!("{}/wyoming-openwakeword", home),
            wake_words: format!("{}/custom-wake-words", home),
            satellite,
        }
    }
}

impl SatelliteConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("wyoming_satellite.name", &self.name),
            ("wyoming_satellite.uri", &self.uri),
            ("wyoming_satellite.audio.mic_device", &self.audio.mic_device),
            ("wyoming_satellite.audio.speaker_device", &self.audio.speaker_device),
            ("wyoming_satellite.wake_word.uri", &self.wake_word.uri),
            ("wyoming_satellite.wake_word.name", &self.wake_word.name),
            ("wyoming_satellite.led_service.uri", &self.led_service.uri),
        ];
        for (key, value) in fields {
            if value.contains('\'') {
                return Err(ConfigError::invalid(NAME, key, "must not contain single quotes"));
            }
        }
        if self.led_service.enabled
            && !["2mic", "4mic", "usb_4mic"].contains(&self.led_service.kind.as_str())
        {
            return Err(ConfigError::invalid(
                NAME,
                "wyoming_satellite.led_service.type",
                format!("unknown LED board '{}'", self.led_service.kind),
            ));
        }
        for model in &self.wake_word.custom_models {
            if model.name.is_empty() || model.name.contains(['/', '\'']) {
                return Err(ConfigError::invalid(
                    NAME,
                    "wyoming_satellite.wake_word.custom_models.name",
                    format!("'{}' is not a usable model name", model.name),
                ));
            }
        }
        Ok(())
    }

    fn satellite_args(&self) -> Vec<String> {
        let mic = format!(
            "arecord -D {} -r 16000 -c 1 -f S16_LE -t raw",
            self.audio.mic_device
        );
        let snd = format!(
            "aplay -D {} -r 22050 -c 1 -f S16_LE -t raw",
            self.audio.speaker_device
        );
        let mut args = vec![
            quoted("--name", &self.name),
            quoted("--uri", &self.uri),
            quoted("--mic-command", &mic),
            quoted("--snd-command", &snd),
        ];
        let e = &self.enhancements;
        if let Some(gain) = e.auto_gain {
            args.push(format!("--mic-auto-gain {}", gain));
        }
        if let Some(level) = e.noise_suppression {
            args.push(format!("--mic-noise-suppression {}", level));
        }
        if let Some(multiplier) = e.mic_volume_multiplier {
            args.push(format!("--mic-volume-multiplier {}", multiplier));
        }
        if let Some(multiplier) = e.snd_volume_multiplier {
            args.push(format!("--snd-volume-multiplier {}", multiplier));
        }
        if self.wake_word.enabled {
            args.push(quoted("--wake-uri", &self.wake_word.uri));
            args.push(quoted("--wake-word-name", &self.wake_word.name));
        }
        if self.led_service.enabled {
            args.push(quoted("--event-uri", &self.led_service.uri));
        }
        args
    }

    fn satellite_unit(&self, layout: &Layout) -> String {
        let mut exec = vec![format!("{}/script/run", layout.satellite)];
        exec.extend(self.satellite_args());

        let mut unit = UnitFile::service("Wyoming Satellite")
            .wants("network-online.target")
            .after("network-online.target");
        if self.wake_word.enabled {
            unit = unit.requires(OPENWAKEWORD_UNIT).after(OPENWAKEWORD_UNIT);
        }
        if self.led_service.enabled {
            let led = self.led_service.unit();
            unit = unit.requires(&led).after(&led);
        }
        unit.set("Type", "simple")
            .set("ExecStart", continued(&exec))
            .set("WorkingDirectory", layout.satellite.as_str())
            .set("Restart", "always")
            .set("RestartSec", "1")
            .render()
    }

    fn openwakeword_unit(&self, layout: &Layout) -> String {
        let mut exec = vec![
            format!("{}/script/run", layout.openwakeword),
            quoted("--uri", &self.wake_word.uri),
        ];
        if !self.wake_word.custom_models.is_empty() {
            exec.push(format!("--custom-model-dir {}", layout.wake_words));
        }
        for model in &self.wake_word.preload_models {
            exec.push(quoted("--preload-model", model));
        }
        UnitFile::service("Wyoming openWakeWord")
            .wants("network-online.target")
            .after("network-online.target")
            .set("Type", "simple")
            .set("ExecStart", continued(&exec))
            .set("WorkingDirectory", layout.openwakeword.as_str())
            .set("Restart", "always")
            .set("RestartSec", "1")
            .render()
    }

    fn led_unit(&self, layout: &Layout) -> String {
        let led = &self.led_service;
        let mut exec = vec![
            format!("{}/.venv/bin/python3 {}_service.py", layout.examples, led.kind),
            quoted("--uri", &led.uri),
        ];
        if led.brightness != 15 {
            exec.push(format!("--led-brightness {}", led.brightness));
        }
        UnitFile::service(format!("{} LEDs", led.kind.to_uppercase()))
            .set("Type", "simple")
            .set("ExecStart", continued(&exec))
            .set("WorkingDirectory", layout.examples.as_str())
            .set("Restart", "always")
            .set("RestartSec", "1")
            .render()
    }
}

pub struct VoiceSatellite;

impl VoiceSatellite {
    /// Unit file plus enabled service; the restart fires only on unit edits
    fn service(plan: &mut ModulePlan, unit: &str, content: String) -> String {
        let file = plan.add(FileContent::new(unit_spec(unit), content).with_backup());
        plan.add(ServiceState::running(unit));
        plan.notify(HandlerAction::Restart(unit.to_string()), &[file.clone()]);
        file
    }
}

impl ProvisionModule for VoiceSatellite {
    fn name(&self) -> &'static str {
        NAME
    }

    fn block(&self) -> &'static str {
        "wyoming_satellite"
    }

    fn description(&self) -> &'static str {
        "Wyoming voice satellite, openWakeWord and LED services"
    }

    fn build(&self, ctx: &BuildContext) -> Result<ModulePlan, ConfigError> {
        let config: SatelliteConfig = ctx.block(NAME, self.block())?;
        config.validate()?;
        let layout = Layout::new(ctx.home());
        let satellite_pip = format!("{}/.venv/bin/pip3", layout.satellite);
        let led_pip = format!("{}/.venv/bin/pip3", layout.examples);

        let mut plan = ModulePlan::new(NAME);
        plan.add(AptPackages::new(SYSTEM_PACKAGES).with_update());
        let satellite_repo = plan.add(GitRepo::new(SATELLITE_URL, layout.satellite.clone(), "master"));
        let openwakeword_repo = plan.add(GitRepo::new(
            OPENWAKEWORD_URL,
            layout.openwakeword.clone(),
            "master",
        ));

        if ctx.host.block_enabled("respeaker_hat") {
            plan.add(Command::new(
                "Install ReSpeaker drivers",
                CommandSpec::root(format!(
                    "cd {} && bash etc/install-respeaker-drivers.sh",
                    quote(&layout.satellite)
                ))
                .timeout(DRIVER_TIMEOUT),
                Condition::Unless(CommandSpec::root(
                    "/usr/sbin/dkms status | grep -q seeed-voicecard",
                )),
            ));
        }

        plan.add(Command::new(
            "Create wyoming-satellite virtual environment",
            CommandSpec::user(format!("python3 -m venv {}/.venv", quote(&layout.satellite))),
            Condition::Creates(format!("{}/.venv/bin/python3", layout.satellite)),
        ));
        plan.add(PipPackages::new(satellite_pip.clone(), BASE_PIP));
        plan.add(Command::new(
            "Create LED service virtual environment",
            CommandSpec::user(format!(
                "python3 -m venv --system-site-packages {}/.venv",
                quote(&layout.examples)
            )),
            Condition::Creates(format!("{}/.venv/bin/python3", layout.examples)),
        ));
        let mut led_packages: Vec<&str> = BASE_PIP.to_vec();
        led_packages.push("wyoming==1.5.2");
        if config.led_service.enabled && config.led_service.kind == "usb_4mic" {
            led_packages.push("pixel-ring");
        }
        plan.add(PipPackages::new(led_pip, &led_packages));

        plan.notify(
            HandlerAction::Run {
                name: "Install wyoming-satellite with extras".to_string(),
                command: CommandSpec::user(format!(
                    "cd {} && .venv/bin/pip3 install -f {} -e '.[all]'",
                    quote(&layout.satellite),
                    quote(PREBUILT_WHEELS)
                )),
            },
            &[satellite_repo],
        );
        plan.notify(
            HandlerAction::Run {
                name: "Set up wyoming-openwakeword".to_string(),
                command: CommandSpec::user(format!(
                    "cd {} && script/setup",
                    quote(&layout.openwakeword)
                )),
            },
            &[openwakeword_repo],
        );

        let mut units = Vec::new();
        if config.wake_word.enabled {
            if !config.wake_word.custom_models.is_empty() {
                plan.add(Directory::new(FileSpec::user(layout.wake_words.clone(), "0755")));
                for model in &config.wake_word.custom_models {
                    plan.add(Download::user(
                        model.url.clone(),
                        format!("{}/{}.tflite", layout.wake_words, model.name),
                        "0644",
                    ));
                }
            }
            units.push(Self::service(
                &mut plan,
                OPENWAKEWORD_UNIT,
                config.openwakeword_unit(&layout),
            ));
        }
        if config.led_service.enabled {
            units.push(Self::service(
                &mut plan,
                &config.led_service.unit(),
                config.led_unit(&layout),
            ));
        }
        units.push(Self::service(
            &mut plan,
            SATELLITE_UNIT,
            config.satellite_unit(&layout),
        ));
        plan.notify(HandlerAction::DaemonReload, &units);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testutil::*;
    use declarative::CommandOutput;
    use declarative::testing::FakeHost;
    use serde_json::json;

    const HOME: &str = "/home/admin";

    fn satellite_host() -> FakeHost {
        let host = FakeHost::new("phobos");
        host.respond("pip3 show", CommandOutput::ok("Name: x\nVersion: 1.5.2\n"));
        host.respond("dkms status", CommandOutput::ok("seeed-voicecard/0.3: installed\n"));
        for repo in ["wyoming-satellite", "wyoming-openwakeword"] {
            host.on_run(&format!("/{}.git", repo), move |s| {
                s.directories
                    .insert(format!("{}/{}/.git", HOME, repo), Default::default());
            });
        }
        host.on_run("venv /home/admin/wyoming-satellite/.venv", |s| {
            s.files.insert(
                format!("{}/wyoming-satellite/.venv/bin/python3", HOME),
                Default::default(),
            );
        });
        host.on_run("venv --system-site-packages", |s| {
            s.files.insert(
                format!("{}/wyoming-satellite/examples/.venv/bin/python3", HOME),
                Default::default(),
            );
        });
        host.on_run("custom-wake-words/mirror.tflite", |s| {
            s.files.insert(
                format!("{}/custom-wake-words/mirror.tflite", HOME),
                Default::default(),
            );
        });
        host
    }

    fn full() -> serde_json::Value {
        json!({
            "wyoming_satellite": {
                "name": "phobos",
                "wake_word": {
                    "enabled": true,
                    "custom_models": [{"name": "mirror", "url": "https://example.net/mirror.tflite"}],
                    "preload_models": ["mirror"]
                },
                "led_service": {"enabled": true, "type": "2mic", "brightness": 2},
                "enhancements": {"auto_gain": 5, "noise_suppression": 2}
            },
            "respeaker_hat": {"enabled": true}
        })
    }

    #[test]
    fn test_full_satellite_converges() {
        let host = satellite_host();
        let plan = build(&VoiceSatellite, full()).unwrap();
        assert_idempotent(&plan, &host);

        let unit = host
            .file_text("/etc/systemd/system/wyoming-satellite.service")
            .unwrap();
        assert!(unit.contains("Requires=wyoming-openwakeword.service 2mic_leds.service\n"));
        assert!(unit.contains("ExecStart=/home/admin/wyoming-satellite/script/run \\\n    --name 'phobos'"));
        assert!(unit.contains("--mic-command 'arecord -D plughw:CARD=seeed2micvoicec,DEV=0 -r 16000 -c 1 -f S16_LE -t raw'"));
        assert!(unit.contains("--mic-auto-gain 5"));
        assert!(unit.contains("--wake-word-name 'ok_nabu'"));
        assert!(unit.contains("--event-uri 'tcp://127.0.0.1:10500'"));
        assert!(unit.contains("WorkingDirectory=/home/admin/wyoming-satellite\n"));

        let wake = host
            .file_text("/etc/systemd/system/wyoming-openwakeword.service")
            .unwrap();
        assert!(wake.contains("--custom-model-dir /home/admin/custom-wake-words"));
        assert!(wake.contains("--preload-model 'mirror'"));

        let led = host.file_text("/etc/systemd/system/2mic_leds.service").unwrap();
        assert!(led.contains("Description=2MIC LEDs\n"));
        assert!(led.contains("examples/.venv/bin/python3 2mic_service.py"));
        assert!(led.contains("--led-brightness 2"));

        assert_eq!(host.daemon_reloads(), 1);
        assert_eq!(host.run_count("install -f"), 1);
        assert_eq!(host.run_count("script/setup"), 1);
        assert_eq!(host.run_count("install-respeaker-drivers"), 0);
        assert_eq!(host.restarts(SATELLITE_UNIT), 1);
    }

    #[test]
    fn test_minimal_satellite() {
        let plan = build(&VoiceSatellite, json!({"wyoming_satellite": {}})).unwrap();
        let ids = ids(&plan);
        assert!(ids.contains(&"file:/etc/systemd/system/wyoming-satellite.service".to_string()));
        assert!(!ids.iter().any(|id| id.contains("openwakeword.service")));
        assert!(!ids.iter().any(|id| id.contains("leds")));
        assert!(!ids.iter().any(|id| id.contains("ReSpeaker")));

        let config = SatelliteConfig::default();
        let args = config.satellite_args();
        assert_eq!(args[0], "--name 'my satellite'");
        assert!(!args.iter().any(|a| a.starts_with("--wake-uri")));
        assert!(!args.iter().any(|a| a.starts_with("--mic-auto-gain")));
    }

    #[test]
    fn test_driver_install_when_missing() {
        let host = FakeHost::new("phobos");
        host.respond("pip3 show", CommandOutput::ok("Version: 1.5.2\n"));
        let plan = build(&VoiceSatellite, full()).unwrap();
        run(&plan, &host);
        assert_eq!(host.run_count("bash etc/install-respeaker-drivers.sh"), 1);
    }

    #[test]
    fn test_pip_pins_and_usb_board() {
        let blocks = json!({"wyoming_satellite": {"led_service": {"enabled": true, "type": "usb_4mic"}}});
        let plan = build(&VoiceSatellite, blocks).unwrap();
        assert!(ids(&plan).contains(
            &"pip:/home/admin/wyoming-satellite/examples/.venv/bin/pip3:pip,wheel,setuptools,wyoming==1.5.2,pixel-ring"
                .to_string()
        ));
    }

    #[test]
    fn test_rejects_quotes_and_unknown_board() {
        assert!(matches!(
            build(&VoiceSatellite, json!({"wyoming_satellite": {"name": "bob's"}})).unwrap_err(),
            ConfigError::Invalid { .. }
        ));
        assert!(
            build(
                &VoiceSatellite,
                json!({"wyoming_satellite": {"led_service": {"enabled": true, "type": "8mic"}}})
            )
            .is_err()
        );
        assert_eq!(
            build(&VoiceSatellite, json!({})).unwrap_err(),
            ConfigError::missing(NAME, "wyoming_satellite")
        );
    }
}
