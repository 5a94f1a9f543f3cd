use zerocopy::AsBytes;

/// Directory.
pub const T_DIR: i16 = 1;
/// File.
pub const T_FILE: i16 = 2;
/// Device.
pub const T_DEV: i16 = 3;

/// Metadata record returned by fstat. The layout is part of the user ABI,
/// so it is laid out without implicit padding.
#[repr(C)]
#[derive(AsBytes, Clone, Copy, Default)]
pub struct Stat {
    /// File system's disk device.
    pub dev: i32,

    /// Inode number.
    pub ino: u32,

    /// Type of file.
    pub typ: i16,

    /// Number of links to file.
    pub nlink: i16,

    /// Size of file in bytes.
    pub size: u32,
}
