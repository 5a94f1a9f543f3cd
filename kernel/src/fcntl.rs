use bitflags::bitflags;

bitflags! {
    /// open() flags, shared with user programs.
    pub struct OpenFlags: i32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        !self.intersects(Self::O_WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(Self::O_WRONLY | Self::O_RDWR)
    }
}
