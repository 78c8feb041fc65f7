//! Byte offsets of the UEFI tables efivm lays out in guest memory.

/// `EFI_SYSTEM_TABLE`.
pub mod system {
    pub const HDR: u64 = 0x00;
    pub const FIRMWARE_VENDOR: u64 = 0x18;
    pub const FIRMWARE_REVISION: u64 = 0x20;
    pub const CON_IN_HANDLE: u64 = 0x28;
    pub const CON_IN: u64 = 0x30;
    pub const CON_OUT_HANDLE: u64 = 0x38;
    pub const CON_OUT: u64 = 0x40;
    pub const STD_ERR_HANDLE: u64 = 0x48;
    pub const STD_ERR: u64 = 0x50;
    pub const RUNTIME_SERVICES: u64 = 0x58;
    pub const BOOT_SERVICES: u64 = 0x60;
    pub const NUMBER_OF_TABLE_ENTRIES: u64 = 0x68;
    pub const CONFIGURATION_TABLE: u64 = 0x70;
    pub const SIZE: u64 = 0x78;

    /// "IBI SYST"
    pub const SIGNATURE: u64 = 0x5453_5953_2049_4249;
}

/// `EFI_BOOT_SERVICES`.
pub mod boot {
    pub const RAISE_TPL: u64 = 0x18;
    pub const RESTORE_TPL: u64 = 0x20;
    pub const ALLOCATE_PAGES: u64 = 0x28;
    pub const FREE_PAGES: u64 = 0x30;
    pub const GET_MEMORY_MAP: u64 = 0x38;
    pub const ALLOCATE_POOL: u64 = 0x40;
    pub const FREE_POOL: u64 = 0x48;
    pub const CREATE_EVENT: u64 = 0x50;
    pub const SET_TIMER: u64 = 0x58;
    pub const WAIT_FOR_EVENT: u64 = 0x60;
    pub const SIGNAL_EVENT: u64 = 0x68;
    pub const CLOSE_EVENT: u64 = 0x70;
    pub const CHECK_EVENT: u64 = 0x78;
    pub const INSTALL_PROTOCOL_INTERFACE: u64 = 0x80;
    pub const REINSTALL_PROTOCOL_INTERFACE: u64 = 0x88;
    pub const UNINSTALL_PROTOCOL_INTERFACE: u64 = 0x90;
    pub const HANDLE_PROTOCOL: u64 = 0x98;
    pub const RESERVED: u64 = 0xa0;
    pub const REGISTER_PROTOCOL_NOTIFY: u64 = 0xa8;
    pub const LOCATE_HANDLE: u64 = 0xb0;
    pub const LOCATE_DEVICE_PATH: u64 = 0xb8;
    pub const INSTALL_CONFIGURATION_TABLE: u64 = 0xc0;
    pub const LOAD_IMAGE: u64 = 0xc8;
    pub const START_IMAGE: u64 = 0xd0;
    pub const EXIT: u64 = 0xd8;
    pub const UNLOAD_IMAGE: u64 = 0xe0;
    pub const EXIT_BOOT_SERVICES: u64 = 0xe8;
    pub const GET_NEXT_MONOTONIC_COUNT: u64 = 0xf0;
    pub const STALL: u64 = 0xf8;
    pub const SET_WATCHDOG_TIMER: u64 = 0x100;
    pub const CONNECT_CONTROLLER: u64 = 0x108;
    pub const DISCONNECT_CONTROLLER: u64 = 0x110;
    pub const OPEN_PROTOCOL: u64 = 0x118;
    pub const CLOSE_PROTOCOL: u64 = 0x120;
    pub const OPEN_PROTOCOL_INFORMATION: u64 = 0x128;
    pub const PROTOCOLS_PER_HANDLE: u64 = 0x130;
    pub const LOCATE_HANDLE_BUFFER: u64 = 0x138;
    pub const LOCATE_PROTOCOL: u64 = 0x140;
    pub const INSTALL_MULTIPLE_PROTOCOL_INTERFACES: u64 = 0x148;
    pub const UNINSTALL_MULTIPLE_PROTOCOL_INTERFACES: u64 = 0x150;
    pub const CALCULATE_CRC32: u64 = 0x158;
    pub const COPY_MEM: u64 = 0x160;
    pub const SET_MEM: u64 = 0x168;
    pub const CREATE_EVENT_EX: u64 = 0x170;
    pub const SIZE: u64 = 0x178;

    /// "BOOTSERV"
    pub const SIGNATURE: u64 = 0x5652_4553_544f_4f42;

    pub fn name(off: u64) -> &'static str {
        match off {
            RAISE_TPL => "RaiseTPL",
            RESTORE_TPL => "RestoreTPL",
            ALLOCATE_PAGES => "AllocatePages",
            FREE_PAGES => "FreePages",
            GET_MEMORY_MAP => "GetMemoryMap",
            ALLOCATE_POOL => "AllocatePool",
            FREE_POOL => "FreePool",
            CREATE_EVENT => "CreateEvent",
            SET_TIMER => "SetTimer",
            WAIT_FOR_EVENT => "WaitForEvent",
            SIGNAL_EVENT => "SignalEvent",
            CLOSE_EVENT => "CloseEvent",
            CHECK_EVENT => "CheckEvent",
            INSTALL_PROTOCOL_INTERFACE => "InstallProtocolInterface",
            REINSTALL_PROTOCOL_INTERFACE => "ReinstallProtocolInterface",
            UNINSTALL_PROTOCOL_INTERFACE => "UninstallProtocolInterface",
            HANDLE_PROTOCOL => "HandleProtocol",
            RESERVED => "Reserved",
            REGISTER_PROTOCOL_NOTIFY => "RegisterProtocolNotify",
            LOCATE_HANDLE => "LocateHandle",
            LOCATE_DEVICE_PATH => "LocateDevicePath",
            INSTALL_CONFIGURATION_TABLE => "InstallConfigurationTable",
            LOAD_IMAGE => "LoadImage",
            START_IMAGE => "StartImage",
            EXIT => "Exit",
            UNLOAD_IMAGE => "UnloadImage",
            EXIT_BOOT_SERVICES => "ExitBootServices",
            GET_NEXT_MONOTONIC_COUNT => "GetNextMonotonicCount",
            STALL => "Stall",
            SET_WATCHDOG_TIMER => "SetWatchdogTimer",
            CONNECT_CONTROLLER => "ConnectController",
            DISCONNECT_CONTROLLER => "DisconnectController",
            OPEN_PROTOCOL => "OpenProtocol",
            CLOSE_PROTOCOL => "CloseProtocol",
            OPEN_PROTOCOL_INFORMATION => "OpenProtocolInformation",
            PROTOCOLS_PER_HANDLE => "ProtocolsPerHandle",
            LOCATE_HANDLE_BUFFER => "LocateHandleBuffer",
            LOCATE_PROTOCOL => "LocateProtocol",
            INSTALL_MULTIPLE_PROTOCOL_INTERFACES => "InstallMultipleProtocolInterfaces",
            UNINSTALL_MULTIPLE_PROTOCOL_INTERFACES => "UninstallMultipleProtocolInterfaces",
            CALCULATE_CRC32 => "CalculateCrc32",
            COPY_MEM => "CopyMem",
            SET_MEM => "SetMem",
            CREATE_EVENT_EX => "CreateEventEx",
            _ => "?",
        }
    }
}

/// `EFI_RUNTIME_SERVICES`.
pub mod runtime {
    pub const GET_TIME: u64 = 0x18;
    pub const SET_TIME: u64 = 0x20;
    pub const GET_WAKEUP_TIME: u64 = 0x28;
    pub const SET_WAKEUP_TIME: u64 = 0x30;
    pub const SET_VIRTUAL_ADDRESS_MAP: u64 = 0x38;
    pub const CONVERT_POINTER: u64 = 0x40;
    pub const GET_VARIABLE: u64 = 0x48;
    pub const GET_NEXT_VARIABLE_NAME: u64 = 0x50;
    pub const SET_VARIABLE: u64 = 0x58;
    pub const GET_NEXT_HIGH_MONOTONIC_COUNT: u64 = 0x60;
    pub const RESET_SYSTEM: u64 = 0x68;
    pub const UPDATE_CAPSULE: u64 = 0x70;
    pub const QUERY_CAPSULE_CAPABILITIES: u64 = 0x78;
    pub const QUERY_VARIABLE_INFO: u64 = 0x80;
    pub const SIZE: u64 = 0x88;

    /// "RUNTSERV"
    pub const SIGNATURE: u64 = 0x5652_4553_544e_5552;

    pub fn name(off: u64) -> &'static str {
        match off {
            GET_TIME => "GetTime",
            SET_TIME => "SetTime",
            GET_WAKEUP_TIME => "GetWakeupTime",
            SET_WAKEUP_TIME => "SetWakeupTime",
            SET_VIRTUAL_ADDRESS_MAP => "SetVirtualAddressMap",
            CONVERT_POINTER => "ConvertPointer",
            GET_VARIABLE => "GetVariable",
            GET_NEXT_VARIABLE_NAME => "GetNextVariableName",
            SET_VARIABLE => "SetVariable",
            GET_NEXT_HIGH_MONOTONIC_COUNT => "GetNextHighMonotonicCount",
            RESET_SYSTEM => "ResetSystem",
            UPDATE_CAPSULE => "UpdateCapsule",
            QUERY_CAPSULE_CAPABILITIES => "QueryCapsuleCapabilities",
            QUERY_VARIABLE_INFO => "QueryVariableInfo",
            _ => "?",
        }
    }
}

/// `EFI_SIMPLE_TEXT_OUTPUT_PROTOCOL`.
pub mod text_out {
    pub const RESET: u64 = 0x00;
    pub const OUTPUT_STRING: u64 = 0x08;
    pub const TEST_STRING: u64 = 0x10;
    pub const QUERY_MODE: u64 = 0x18;
    pub const SET_MODE: u64 = 0x20;
    pub const SET_ATTRIBUTE: u64 = 0x28;
    pub const CLEAR_SCREEN: u64 = 0x30;
    pub const SET_CURSOR_POSITION: u64 = 0x38;
    pub const ENABLE_CURSOR: u64 = 0x40;
    pub const MODE: u64 = 0x48;
    pub const SIZE: u64 = 0x50;
}

/// `SIMPLE_TEXT_OUTPUT_MODE`, six 32-bit fields.
pub mod text_mode {
    pub const MAX_MODE: u64 = 0x00;
    pub const MODE: u64 = 0x04;
    pub const ATTRIBUTE: u64 = 0x08;
    pub const CURSOR_COLUMN: u64 = 0x0c;
    pub const CURSOR_ROW: u64 = 0x10;
    pub const CURSOR_VISIBLE: u64 = 0x14;
    pub const SIZE: u64 = 0x18;
}

/// `EFI_SIMPLE_TEXT_INPUT_PROTOCOL`.
pub mod text_in {
    pub const RESET: u64 = 0x00;
    pub const READ_KEY_STROKE: u64 = 0x08;
    pub const WAIT_FOR_KEY: u64 = 0x10;
    pub const SIZE: u64 = 0x18;
}

/// `EFI_LOADED_IMAGE_PROTOCOL`.
pub mod loaded_image {
    pub const REVISION: u64 = 0x00;
    pub const PARENT_HANDLE: u64 = 0x08;
    pub const SYSTEM_TABLE: u64 = 0x10;
    pub const DEVICE_HANDLE: u64 = 0x18;
    pub const FILE_PATH: u64 = 0x20;
    pub const RESERVED: u64 = 0x28;
    pub const LOAD_OPTIONS_SIZE: u64 = 0x30;
    pub const LOAD_OPTIONS: u64 = 0x38;
    pub const IMAGE_BASE: u64 = 0x40;
    pub const IMAGE_SIZE: u64 = 0x48;
    pub const IMAGE_CODE_TYPE: u64 = 0x50;
    pub const IMAGE_DATA_TYPE: u64 = 0x54;
    pub const UNLOAD: u64 = 0x58;
    pub const SIZE: u64 = 0x60;

    pub const REVISION_VALUE: u64 = 0x1000;
}

/// `EFI_BLOCK_IO_PROTOCOL`.
pub mod block_io {
    pub const REVISION: u64 = 0x00;
    pub const MEDIA: u64 = 0x08;
    pub const RESET: u64 = 0x10;
    pub const READ_BLOCKS: u64 = 0x18;
    pub const WRITE_BLOCKS: u64 = 0x20;
    pub const FLUSH_BLOCKS: u64 = 0x28;
    pub const SIZE: u64 = 0x30;

    pub const REVISION_VALUE: u64 = 0x0001_0000;

    /// `EFI_BLOCK_IO_MEDIA`, relative to the media pointer.
    pub mod media {
        pub const MEDIA_ID: u64 = 0x00;
        pub const REMOVABLE_MEDIA: u64 = 0x04;
        pub const MEDIA_PRESENT: u64 = 0x05;
        pub const LOGICAL_PARTITION: u64 = 0x06;
        pub const READ_ONLY: u64 = 0x07;
        pub const WRITE_CACHING: u64 = 0x08;
        pub const BLOCK_SIZE: u64 = 0x0c;
        pub const IO_ALIGN: u64 = 0x10;
        pub const LAST_BLOCK: u64 = 0x18;
        pub const SIZE: u64 = 0x20;
    }
}

/// `EFI_UNICODE_COLLATION_PROTOCOL`.
pub mod collation {
    pub const STRI_COLL: u64 = 0x00;
    pub const METAI_MATCH: u64 = 0x08;
    pub const STR_LWR: u64 = 0x10;
    pub const STR_UPR: u64 = 0x18;
    pub const FAT_TO_STR: u64 = 0x20;
    pub const STR_TO_FAT: u64 = 0x28;
    pub const SUPPORTED_LANGUAGES: u64 = 0x30;
    pub const SIZE: u64 = 0x38;
}

/// `EFI_LOCATE_SEARCH_TYPE`.
pub mod search {
    pub const ALL_HANDLES: u64 = 0;
    pub const BY_REGISTER_NOTIFY: u64 = 1;
    pub const BY_PROTOCOL: u64 = 2;
}

/// OpenProtocol attribute bits.
pub mod open {
    pub const BY_HANDLE_PROTOCOL: u64 = 0x01;
    pub const GET_PROTOCOL: u64 = 0x02;
    pub const TEST_PROTOCOL: u64 = 0x04;
    pub const BY_CHILD_CONTROLLER: u64 = 0x08;
    pub const BY_DRIVER: u64 = 0x10;
    pub const EXCLUSIVE: u64 = 0x20;
}

/// Offset of the first service slot in tables that start with a header.
pub const HEADER_SIZE: u64 = 0x18;
