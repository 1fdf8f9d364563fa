//! Integration tests for device enumeration

mod helpers;

use helpers::{context_with, dongle};
use rtlsdr_session::mock::MockDevice;
use rtlsdr_session::{DeviceFilter, Error, Operation};

#[test]
fn test_no_devices_is_empty_list() {
    let (_driver, context) = context_with(vec![]);
    let devices = context.list_devices().expect("Enumeration should not fail");
    assert!(devices.is_empty());
}

#[test]
fn test_descriptors_follow_driver_order() {
    let (_driver, context) = context_with(vec![
        dongle("00000001"),
        MockDevice::new("NooElec", "NESDR SMArt v5", "32871").with_name("Generic RTL2832U"),
    ]);

    let devices = context.list_devices().unwrap();
    assert_eq!(devices.len(), 2);

    assert_eq!(devices[0].index, 0);
    assert_eq!(devices[0].vendor, "Realtek");
    assert_eq!(devices[0].product, "RTL2838UHIDIR");
    assert_eq!(devices[0].serial, "00000001");
    assert_eq!(devices[0].name, "Generic RTL2832U OEM");

    assert_eq!(devices[1].index, 1);
    assert_eq!(devices[1].vendor, "NooElec");
    assert_eq!(devices[1].serial, "32871");
    assert_eq!(devices[1].name, "Generic RTL2832U");
}

#[test]
fn test_string_failure_fails_whole_enumeration() {
    let (_driver, context) = context_with(vec![
        dongle("00000001"),
        dongle("00000002").fail_usb_strings(-1),
        dongle("00000003"),
    ]);

    let err = context.list_devices().unwrap_err();
    assert_eq!(
        err,
        Error::Driver {
            operation: Operation::Enumerate,
            device: Some(1),
            code: -1
        }
    );
    assert_eq!(err.code(), Some(-1));
}

#[test]
fn test_enumeration_does_not_open_devices() {
    let (driver, context) = context_with(vec![dongle("1"), dongle("2")]);
    context.list_devices().unwrap();
    assert_eq!(driver.opens(), 0);
}

#[test]
fn test_enumeration_reflects_unplug() {
    let (driver, context) = context_with(vec![dongle("1")]);
    assert_eq!(context.list_devices().unwrap().len(), 1);

    driver.unplug_all();
    assert!(context.list_devices().unwrap().is_empty());
}

#[test]
fn test_find_device_by_serial() {
    let (_driver, context) = context_with(vec![dongle("00000001"), dongle("00000002")]);

    let found = context
        .find_device(&DeviceFilter::serial("00000002"))
        .unwrap()
        .expect("Device should be found");
    assert_eq!(found.index, 1);

    assert!(
        context
            .find_device(&DeviceFilter::serial("missing"))
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_find_device_all_filters_must_match() {
    let (_driver, context) = context_with(vec![
        dongle("1"),
        MockDevice::new("NooElec", "NESDR SMArt v5", "1"),
    ]);

    let filter = DeviceFilter {
        vendor: Some("NooElec".to_string()),
        product: None,
        serial: Some("1".to_string()),
    };
    assert_eq!(context.find_device(&filter).unwrap().map(|d| d.index), Some(1));

    let filter = DeviceFilter {
        vendor: Some("NooElec".to_string()),
        product: Some("RTL2838UHIDIR".to_string()),
        serial: None,
    };
    assert_eq!(context.find_device(&filter).unwrap(), None);
}

#[test]
fn test_open_enumerated_device() {
    let (driver, context) = context_with(vec![dongle("1"), dongle("2")]);
    let devices = context.list_devices().unwrap();

    let session = context.session(&devices[1]);
    session.open().unwrap();
    assert_eq!(driver.open_devices(), vec![1]);
    session.close();
    assert!(driver.open_devices().is_empty());
}
