/// A 16-bit segment selector: a table index, a table indicator bit, and a
/// requested privilege level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Selector(pub u16);

impl Selector {
    pub const NULL: Selector = Selector(0);

    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Byte offset of the descriptor within its table.
    #[inline]
    pub fn index(self) -> u16 {
        self.0 & !0b111
    }

    /// `true` selects the LDT, `false` the GDT.
    #[inline]
    pub fn table_indicator(self) -> bool {
        self.0 & 0b100 != 0
    }

    #[inline]
    pub fn rpl(self) -> u8 {
        (self.0 & 0b11) as u8
    }

    /// A selector is "null" when both its index and RPL are zero; this core
    /// treats `selector == 0` (with no regard to limit/base, which are only
    /// meaningful once a descriptor has been loaded) as the null-selector
    /// case that must fault on use.
    #[inline]
    pub fn is_null(self) -> bool {
        self.index() == 0 && !self.table_indicator()
    }
}

impl From<u16> for Selector {
    fn from(v: u16) -> Self {
        Selector(v)
    }
}
