//! Header words of a frame in the controller FIFOs

use bitfield::bitfield;

bitfield! {
    /// Word 0: identifier register
    #[derive(Copy, Clone)]
    pub struct IdWord(u32);
    impl Debug;
    /// Standard identifier
    pub u16, id, set_id: 31, 21;
    /// Substitute remote request
    pub srr, _: 20;
    /// Identifier extension
    pub ide, _: 19;
    /// Extended identifier
    pub u32, id_ext, _: 18, 1;
    /// Remote transmission request
    pub rtr, _: 0;
}

bitfield! {
    /// Word 1: data length code register
    #[derive(Copy, Clone)]
    pub struct DlcWord(u32);
    impl Debug;
    /// Data length code
    pub u8, dlc, set_dlc: 31, 28;
}
