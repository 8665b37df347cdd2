use std::net::Ipv4Addr;
use std::time::Duration;

use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{Gpio2, Output, PinDriver},
        modem::Modem,
        prelude::Peripherals,
    },
    ipv4::{self, Mask, Subnet},
    netif::{EspNetif, NetifConfiguration, NetifStack},
    wifi::{
        AccessPointConfiguration, AuthMethod, BlockingWifi, Configuration as WifiConfig, EspWifi,
        WifiDriver,
    },
};

use crate::setting::Setting;

const AP_NETMASK: Mask = Mask(24);
const AP_MAX_CONNECTIONS: u16 = 8;

pub fn init_logger() {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
}

pub struct Board {
    led: PinDriver<'static, Gpio2, Output>,
    modem: Option<Modem>,
    sysloop: EspSystemEventLoop,
    wifi: Option<BlockingWifi<EspWifi<'static>>>,
}

impl Board {
    pub fn take() -> anyhow::Result<Self> {
        let peripherals = Peripherals::take()?;
        let sysloop = EspSystemEventLoop::take()?;
        let led = PinDriver::output(peripherals.pins.gpio2)?;

        Ok(Self {
            led,
            modem: Some(peripherals.modem),
            sysloop,
            wifi: None,
        })
    }

    pub fn blink(&mut self, duration: Duration) {
        if let Err(e) = self.led.set_high() {
            log::warn!("Failed to turn LED on: {:?}", e);
        }
        std::thread::sleep(duration);
        if let Err(e) = self.led.set_low() {
            log::warn!("Failed to turn LED off: {:?}", e);
        }
    }

    /// 启动 SoftAP，DHCP 下发的 DNS 指向本机
    pub fn start_ap(&mut self, setting: &Setting) -> anyhow::Result<Ipv4Addr> {
        let modem = self
            .modem
            .take()
            .ok_or_else(|| anyhow::anyhow!("SoftAP already started"))?;
        let ip = setting.device_ip.unwrap_or(super::AP_IP);

        let ap_netif_config = NetifConfiguration {
            ip_configuration: Some(ipv4::Configuration::Router(ipv4::RouterConfiguration {
                subnet: Subnet {
                    gateway: ip,
                    mask: AP_NETMASK,
                },
                dhcp_enabled: true,
                dns: Some(ip),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        };
        let ap_netif = EspNetif::new_with_conf(&ap_netif_config)?;

        let driver = WifiDriver::new(modem, self.sysloop.clone(), None)?;
        // AP 模式不用 STA，但 wrap_all 需要
        let sta_netif = EspNetif::new(NetifStack::Sta)?;

        let mut wifi = BlockingWifi::wrap(
            EspWifi::wrap_all(driver, sta_netif, ap_netif)?,
            self.sysloop.clone(),
        )?;

        let ap_config = AccessPointConfiguration {
            ssid: setting
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("SSID too long: {}", setting.ap_ssid))?,
            ssid_hidden: false,
            channel: 1,
            auth_method: AuthMethod::None,
            max_connections: AP_MAX_CONNECTIONS,
            ..Default::default()
        };

        wifi.set_configuration(&WifiConfig::AccessPoint(ap_config))?;
        wifi.start()?;

        let ip = wifi.wifi().ap_netif().get_ip_info()?.ip;
        log::info!("SoftAP started: {} at {}", setting.ap_ssid, ip);

        self.wifi = Some(wifi);
        Ok(ip)
    }

    /// 慢闪，永不返回；需要断电或按复位键
    pub fn fault_loop(&mut self) -> ! {
        log::error!("Device halted, power-cycle required");
        loop {
            self.blink(super::FAULT_BLINK);
            std::thread::sleep(super::FAULT_BLINK);
        }
    }
}
