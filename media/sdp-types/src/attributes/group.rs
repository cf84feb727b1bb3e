use crate::{IResult, not_whitespace};
use nom::bytes::complete::take_while1;
use nom::character::complete::space1;
use nom::combinator::map;
use nom::multi::separated_list1;
use nom::sequence::separated_pair;
use std::fmt;

/// Group attribute (`a=group`), e.g. `BUNDLE 0 1 2`
///
/// [RFC5888](https://www.rfc-editor.org/rfc/rfc5888)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub typ: String,
    pub mids: Vec<String>,
}

impl Group {
    pub fn parse(i: &str) -> IResult<'_, Self> {
        map(
            separated_pair(
                // type
                map(take_while1(not_whitespace), String::from),
                space1,
                // mids
                separated_list1(space1, map(take_while1(not_whitespace), String::from)),
            ),
            |(typ, mids)| Self { typ, mids },
        )(i)
    }

    pub fn is_bundle(&self) -> bool {
        self.typ.eq_ignore_ascii_case("BUNDLE")
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.typ)?;

        for mid in &self.mids {
            write!(f, " {mid}")?;
        }

        Ok(())
    }
}
