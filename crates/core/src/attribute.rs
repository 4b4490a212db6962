/// How a mapped attribute relates to its owning entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeClassification {
    Basic,
    Embedded,
    Any,
    ManyToOne,
    OneToOne,
    Collection,
}

impl AttributeClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Embedded => "embedded",
            Self::Any => "any",
            Self::ManyToOne => "many-to-one",
            Self::OneToOne => "one-to-one",
            Self::Collection => "collection",
        }
    }
}

impl std::fmt::Display for AttributeClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
