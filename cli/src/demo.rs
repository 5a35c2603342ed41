// Demo radio environment
//
// A handful of simulated peripherals the CLI talks to in place of a real
// adapter.

use bleman_core::{
    from_short, CharacteristicProperties, EventSink, Service, SimulatedPeripheral,
    SimulatedPlatform,
};
use std::time::Duration;

pub const HEART_RATE_MONITOR: &str = "C4:7C:8D:6A:11:01";
pub const THERMOMETER: &str = "C4:7C:8D:6A:11:02";
pub const UART_BRIDGE: &str = "C4:7C:8D:6A:11:03";
pub const SLEEPY_TAG: &str = "C4:7C:8D:6A:11:04";

/// Build the simulated stack and populate it
pub fn world(sink: EventSink) -> SimulatedPlatform {
    let platform = SimulatedPlatform::new(sink)
        .with_latency(Duration::from_millis(30))
        .with_notify_period(Duration::from_millis(400));

    platform.add_peripheral(
        SimulatedPeripheral::new(HEART_RATE_MONITOR)
            .with_name("HRM Pro")
            .with_rssi(-58)
            .with_advertisement(vec![0x02, 0x01, 0x06, 0x03, 0x03, 0x0D, 0x18])
            .with_service(
                Service::new(from_short(0x180D))
                    .with_characteristic(
                        from_short(0x2A37),
                        CharacteristicProperties::default().with_notify(),
                    )
                    .with_characteristic(from_short(0x2A38), CharacteristicProperties::readable())
                    .with_characteristic(
                        from_short(0x2A39),
                        CharacteristicProperties::default().with_write(),
                    ),
            )
            .with_service(
                Service::new(from_short(0x180F)).with_characteristic(
                    from_short(0x2A19),
                    CharacteristicProperties::readable().with_notify(),
                ),
            )
            .with_value(from_short(0x180D), from_short(0x2A37), vec![0x06, 0x48])
            .with_value(from_short(0x180D), from_short(0x2A38), vec![0x01])
            .with_value(from_short(0x180F), from_short(0x2A19), vec![92]),
    );

    platform.add_peripheral(
        SimulatedPeripheral::new(THERMOMETER)
            .with_name("Thermo")
            .with_rssi(-71)
            .with_service(
                Service::new(from_short(0x1809)).with_characteristic(
                    from_short(0x2A1C),
                    CharacteristicProperties::default().with_indicate().with_read(),
                ),
            )
            .with_value(from_short(0x1809), from_short(0x2A1C), vec![0x00, 0x72, 0x0E, 0x00, 0xFE]),
    );

    platform.add_peripheral(
        SimulatedPeripheral::new(UART_BRIDGE)
            .with_name("UART")
            .with_rssi(-80)
            .with_service(
                Service::new(from_short(0xFFE0)).with_characteristic(
                    from_short(0xFFE1),
                    CharacteristicProperties::readable()
                        .with_write()
                        .with_write_without_response()
                        .with_notify(),
                ),
            ),
    );

    platform.add_peripheral(
        SimulatedPeripheral::new(SLEEPY_TAG)
            .with_rssi(-95)
            .unresponsive(),
    );

    platform
}
