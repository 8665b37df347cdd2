use std::net::Ipv4Addr;
use std::time::Duration;

use crate::setting::Setting;

pub fn init_logger() {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();
}

/// 主机上没有 LED 和 WiFi，只打印日志
pub struct Board {
    led_on: bool,
}

impl Board {
    pub fn take() -> anyhow::Result<Self> {
        Ok(Self { led_on: false })
    }

    fn set_led(&mut self, on: bool) {
        self.led_on = on;
        log::debug!("LED {}", if on { "on" } else { "off" });
    }

    pub fn blink(&mut self, duration: Duration) {
        self.set_led(true);
        std::thread::sleep(duration);
        self.set_led(false);
    }

    pub fn start_ap(&mut self, setting: &Setting) -> anyhow::Result<Ipv4Addr> {
        let ip = setting.device_ip.unwrap_or(super::AP_IP);
        log::info!("SoftAP (host, simulated): {} at {}", setting.ap_ssid, ip);
        Ok(ip)
    }

    /// 慢闪，永不返回；需要外部重启
    pub fn fault_loop(&mut self) -> ! {
        log::error!("Device halted, restart required");
        loop {
            self.blink(super::FAULT_BLINK);
            std::thread::sleep(super::FAULT_BLINK);
        }
    }
}
