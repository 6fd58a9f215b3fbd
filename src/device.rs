use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Display name to package for apps the model commonly launches by name.
pub const APP_PACKAGES: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("WeChat", "com.tencent.mm"),
    ("QQ", "com.tencent.mobileqq"),
    ("支付宝", "com.eg.android.AlipayGphone"),
    ("Alipay", "com.eg.android.AlipayGphone"),
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("美团", "com.sankuai.meituan"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("小红书", "com.xingin.xhs"),
    ("高德地图", "com.autonavi.minimap"),
    ("Settings", "com.android.settings"),
    ("设置", "com.android.settings"),
    ("Chrome", "com.android.chrome"),
    ("Gmail", "com.google.android.gm"),
    ("Google Maps", "com.google.android.apps.maps"),
    ("YouTube", "com.google.android.youtube"),
    ("Camera", "com.android.camera"),
    ("相机", "com.android.camera"),
    ("Clock", "com.android.deskclock"),
    ("时钟", "com.android.deskclock"),
    ("Files", "com.android.documentsui"),
    ("文件管理", "com.android.documentsui"),
];

pub fn package_for(app: &str) -> Option<&'static str> {
    let wanted = app.trim();
    APP_PACKAGES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
        .map(|(_, pkg)| *pkg)
}

pub fn app_for_package(package: &str) -> Option<&'static str> {
    APP_PACKAGES
        .iter()
        .find(|(_, pkg)| *pkg == package)
        .map(|(name, _)| *name)
}

#[derive(Clone, Debug)]
pub struct AdbConfig {
    pub adb_path: String,
    pub device_id: Option<String>,
    pub command_timeout: Duration,
    /// Pause after each input so the UI can settle before the next capture.
    pub settle_delay: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: std::env::var("ADB_PATH").unwrap_or_else(|_| "adb".into()),
            device_id: None,
            command_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Capture {
    Png(Vec<u8>),
    /// The device refused to capture (secure overlay, payment page).
    Refused,
}

/// Thin async wrapper over the `adb` CLI.
#[derive(Clone, Debug)]
pub struct Adb {
    cfg: AdbConfig,
}

impl Adb {
    pub fn new(cfg: AdbConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &AdbConfig {
        &self.cfg
    }

    /// Same settings, different target device.
    pub fn for_device(&self, device_id: Option<&str>) -> Self {
        let mut cfg = self.cfg.clone();
        if let Some(id) = device_id {
            cfg.device_id = Some(id.to_string());
        }
        Self { cfg }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.cfg.adb_path);
        if let Some(id) = &self.cfg.device_id {
            cmd.arg("-s").arg(id);
        }
        cmd.args(args).kill_on_drop(true);
        timeout(self.cfg.command_timeout, cmd.output())
            .await
            .with_context(|| format!("adb {} timed out", args.join(" ")))?
            .with_context(|| format!("failed to spawn {}", self.cfg.adb_path))
    }

    pub async fn shell(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.run(&full).await?;
        if !out.status.success() {
            bail!(
                "adb shell {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub async fn screencap(&self) -> Result<Capture> {
        let out = self.run(&["exec-out", "screencap", "-p"]).await?;
        classify_screencap(&out.stdout, &out.stderr)
    }

    pub async fn current_package(&self) -> Result<Option<String>> {
        let dump = self.shell(&["dumpsys", "window"]).await?;
        Ok(parse_focused_package(&dump))
    }

    pub async fn tap(&self, x: i32, y: i32) -> Result<()> {
        self.input(&["tap", &x.to_string(), &y.to_string()]).await
    }

    pub async fn double_tap(&self, x: i32, y: i32) -> Result<()> {
        self.tap(x, y).await?;
        sleep(Duration::from_millis(100)).await;
        self.tap(x, y).await
    }

    pub async fn long_press(&self, x: i32, y: i32, hold: Duration) -> Result<()> {
        let (xs, ys) = (x.to_string(), y.to_string());
        let ms = hold.as_millis().to_string();
        self.input(&["swipe", &xs, &ys, &xs, &ys, &ms]).await
    }

    pub async fn swipe(&self, from: (i32, i32), to: (i32, i32), duration: Duration) -> Result<()> {
        self.input(&[
            "swipe",
            &from.0.to_string(),
            &from.1.to_string(),
            &to.0.to_string(),
            &to.1.to_string(),
            &duration.as_millis().to_string(),
        ])
        .await
    }

    pub async fn back(&self) -> Result<()> {
        self.input(&["keyevent", "4"]).await
    }

    pub async fn home(&self) -> Result<()> {
        self.input(&["keyevent", "KEYCODE_HOME"]).await
    }

    pub async fn launch(&self, package: &str) -> Result<()> {
        let out = self
            .shell(&["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"])
            .await?;
        if out.contains("No activities found") {
            bail!("no launchable activity in {package}");
        }
        Ok(())
    }

    /// Types through the ADB Keyboard IME, which accepts arbitrary Unicode.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.shell(&["am", "broadcast", "-a", "ADB_CLEAR_TEXT"]).await?;
        let encoded = STANDARD.encode(text.as_bytes());
        self.shell(&["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded])
            .await?;
        Ok(())
    }

    async fn input(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["input"];
        full.extend_from_slice(args);
        self.shell(&full).await?;
        Ok(())
    }
}

fn classify_screencap(stdout: &[u8], stderr: &[u8]) -> Result<Capture> {
    if stdout.starts_with(PNG_SIGNATURE) {
        return Ok(Capture::Png(stdout.to_vec()));
    }
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(stdout),
        String::from_utf8_lossy(stderr)
    );
    if text.contains("Status: -1") || text.contains("Failed") {
        return Ok(Capture::Refused);
    }
    bail!("screencap returned no image: {}", text.trim())
}

/// Package of the focused window from `dumpsys window` output.
fn parse_focused_package(dump: &str) -> Option<String> {
    dump.lines()
        .filter(|line| line.contains("mCurrentFocus") || line.contains("mFocusedApp"))
        .find_map(|line| {
            line.split_whitespace()
                .find(|tok| tok.contains('/'))
                .and_then(|tok| tok.split('/').next())
                .map(|pkg| pkg.trim_start_matches('{').to_string())
                .filter(|pkg| pkg.contains('.'))
        })
}
